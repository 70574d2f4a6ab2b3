use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::alias::{AliasMap, BatchContext, EntityKind};

/// Identifier fields collected from decoded tool payloads, in this order.
pub const IDENTIFIER_FIELDS: &[&str] = &["character_id", "scene_id", "webtoon_id"];

/// Asset-path fields eligible for public URL rewriting.
pub const ASSET_URL_FIELDS: &[&str] = &["image_url", "webtoon_url", "video_url"];

/// Extensions the rewriter treats as relay-served media.
pub const MEDIA_EXTENSIONS: &[&str] = &[".png", ".mp4"];

/// Decoded shape of one textual content item. Classified once at decode time
/// instead of probing the document on every use.
#[derive(Debug)]
pub enum ToolPayload {
    /// Carries at least one recognized new-entity identifier.
    Creator {
        ids: Vec<String>,
        doc: Map<String, Value>,
    },
    /// No new identifier, but at least one recognized asset field.
    AssetBearing { doc: Map<String, Value> },
    Generic { doc: Map<String, Value> },
}

impl ToolPayload {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let doc: Map<String, Value> = serde_json::from_str(text)?;
        let ids = IDENTIFIER_FIELDS
            .iter()
            .filter_map(|field| doc.get(*field).and_then(Value::as_str))
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if !ids.is_empty() {
            return Ok(Self::Creator { ids, doc });
        }
        let has_assets = ASSET_URL_FIELDS
            .iter()
            .any(|field| doc.get(*field).and_then(Value::as_str).is_some());
        if has_assets {
            return Ok(Self::AssetBearing { doc });
        }
        Ok(Self::Generic { doc })
    }

    pub fn produced_ids(&self) -> &[String] {
        match self {
            Self::Creator { ids, .. } => ids,
            _ => &[],
        }
    }

    fn doc_mut(&mut self) -> &mut Map<String, Value> {
        match self {
            Self::Creator { doc, .. } | Self::AssetBearing { doc } | Self::Generic { doc } => doc,
        }
    }

    fn doc(&self) -> &Map<String, Value> {
        match self {
            Self::Creator { doc, .. } | Self::AssetBearing { doc } | Self::Generic { doc } => doc,
        }
    }
}

/// Rewrites every recognized asset field of `doc` whose value ends in a
/// recognized media extension. The last two path segments become the public
/// `{category, filename}` pair; anything shorter passes through unrewritten.
/// Returns how many fields were rewritten.
pub fn rewrite_asset_urls(doc: &mut Map<String, Value>, public_base: &str) -> usize {
    let mut rewritten = 0;
    for field in ASSET_URL_FIELDS {
        let Some(value) = doc.get(*field).and_then(Value::as_str) else {
            continue;
        };
        if let Some(public_url) = public_asset_url(value, public_base) {
            doc.insert((*field).to_owned(), Value::String(public_url));
            rewritten += 1;
        }
    }
    rewritten
}

fn public_asset_url(path: &str, public_base: &str) -> Option<String> {
    if !MEDIA_EXTENSIONS
        .iter()
        .any(|extension| path.ends_with(extension))
    {
        return None;
    }
    let mut segments = path.rsplit('/');
    let filename = segments.next().filter(|segment| !segment.is_empty())?;
    let category = segments.next().filter(|segment| !segment.is_empty())?;
    Some(format!("{public_base}/image/{category}/{filename}"))
}

/// Processes one call's envelope entries in place: decodes each textual
/// content item, registers creator aliases, rewrites asset URLs, and
/// re-encodes the payload. Returns every identifier the call produced.
/// A content item that fails to decode is logged and left untouched.
pub fn rewrite_call_result(
    entries: &mut [Value],
    tool: &str,
    public_base: &str,
    aliases: &mut AliasMap,
    context: &mut BatchContext,
) -> Vec<String> {
    let creator_kind = EntityKind::for_creator_tool(tool);
    let mut produced_ids = Vec::new();

    for entry in entries.iter_mut() {
        let Some(content) = entry
            .pointer_mut("/result/content")
            .and_then(Value::as_array_mut)
        else {
            continue;
        };
        for item in content.iter_mut() {
            if item.get("type").and_then(Value::as_str) != Some("text") {
                continue;
            }
            let Some(text) = item.get("text").and_then(Value::as_str) else {
                continue;
            };
            let mut payload = match ToolPayload::decode(text) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("skipping undecodable content item from {tool}: {err}");
                    continue;
                }
            };
            produced_ids.extend(payload.produced_ids().iter().cloned());

            if let Some(kind) = creator_kind {
                if let Some(real_id) = payload.doc().get(kind.id_field()).and_then(Value::as_str) {
                    let key = context.next_alias_key(kind);
                    debug!("registered alias {key} -> {real_id} from {tool}");
                    aliases.register(key, real_id.to_owned());
                }
            }

            rewrite_asset_urls(payload.doc_mut(), public_base);
            match serde_json::to_string(payload.doc()) {
                Ok(encoded) => {
                    item["text"] = Value::String(encoded);
                }
                Err(err) => {
                    warn!("failed re-encoding content item from {tool}: {err}");
                }
            }
        }
    }

    if let Some(kind) = creator_kind {
        context.record_created_ids(kind, &produced_ids);
    }
    produced_ids
}
