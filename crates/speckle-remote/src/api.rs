//! Wire format of the object server HTTP API.
//!
//! | method | path | body | response |
//! |---|---|---|---|
//! | GET | `api/ping` | | `pong` |
//! | POST | `api/getobjects/{stream}` | [`IdList`] | `id\tjson` lines |
//! | POST | `api/diff/{stream}` | [`IdList`] | `{id: bool}` |
//! | POST | `objects/{stream}` | multipart, JSON array parts, maybe gzip | |
//! | GET | `objects/{stream}/{id}/single` | | fragment JSON |
//! | POST | `api/stream/{stream}/blob` | multipart, one `hash:{id}` part per file | |
//! | POST | `api/stream/{stream}/blob/diff` | JSON array of ids | JSON array of missing ids |
//! | GET | `api/stream/{stream}/blob/{id}` | | file bytes |

use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use speckle_types::{Fragment, ObjectId};

pub const PING: &str = "api/ping";
pub const PONG: &str = "pong";

/// Multipart field name prefix of object upload parts.
pub const BATCH_PART_PREFIX: &str = "batch-";
/// Multipart field name prefix of blob upload parts.
pub const BLOB_PART_PREFIX: &str = "hash:";

pub const JSON_MIME: &str = "application/json";
pub const GZIP_MIME: &str = "application/gzip";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn get_objects(stream: &str) -> String {
    format!("api/getobjects/{stream}")
}

pub fn diff(stream: &str) -> String {
    format!("api/diff/{stream}")
}

pub fn upload(stream: &str) -> String {
    format!("objects/{stream}")
}

pub fn single(stream: &str, id: &ObjectId) -> String {
    format!("objects/{stream}/{id}/single")
}

pub fn blob_upload(stream: &str) -> String {
    format!("api/stream/{stream}/blob")
}

pub fn blob_diff(stream: &str) -> String {
    format!("api/stream/{stream}/blob/diff")
}

pub fn blob_download(stream: &str, id: &ObjectId) -> String {
    format!("api/stream/{stream}/blob/{id}")
}

/// Request body carrying a list of ids as a JSON-encoded string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdList {
    pub objects: String,
}

impl IdList {
    pub fn new(ids: &[ObjectId]) -> Self {
        let hex: Vec<String> = ids.iter().map(ObjectId::to_hex).collect();
        Self {
            objects: serde_json::Value::from(hex).to_string(),
        }
    }

    pub fn ids(&self) -> Result<Vec<ObjectId>, String> {
        serde_json::from_str(&self.objects).map_err(|e| format!("invalid id list: {e}"))
    }
}

/// Response of the diff endpoint: whether each queried id is present.
pub type DiffResponse = HashMap<String, bool>;

pub fn write_object_line(out: &mut String, id: &ObjectId, json: &str) {
    out.push_str(&id.to_hex());
    out.push('\t');
    out.push_str(json);
    out.push('\n');
}

/// Parse an `id\tjson` line stream. Blank lines are skipped.
pub fn parse_object_lines(body: &str) -> Result<Vec<(ObjectId, String)>, String> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (id, json) = line
                .split_once('\t')
                .ok_or_else(|| format!("line without tab separator: {}", preview(line)))?;
            let id = ObjectId::from_hex(id.trim()).map_err(|e| e.to_string())?;
            Ok((id, json.to_string()))
        })
        .collect()
}

/// Encode fragments as one upload part: a JSON array of their bodies,
/// optionally gzip-compressed.
pub fn encode_batch(fragments: &[&Fragment], gzip: bool) -> std::io::Result<Vec<u8>> {
    let mut body = String::with_capacity(fragments.iter().map(|f| f.size() + 1).sum::<usize>() + 2);
    body.push('[');
    for (i, fragment) in fragments.iter().enumerate() {
        if i > 0 {
            body.push(',');
        }
        body.push_str(&fragment.json);
    }
    body.push(']');

    if !gzip {
        return Ok(body.into_bytes());
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body.as_bytes())?;
    encoder.finish()
}

#[derive(Deserialize)]
struct Header {
    id: ObjectId,
    #[serde(default)]
    speckle_type: String,
}

/// Decode an upload part into fragments, keeping each body byte for byte.
/// Gzip input is detected by its magic number.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Fragment>, String> {
    let text = if bytes.starts_with(&GZIP_MAGIC) {
        let mut text = String::new();
        GzDecoder::new(bytes)
            .read_to_string(&mut text)
            .map_err(|e| format!("invalid gzip part: {e}"))?;
        text
    } else {
        String::from_utf8(bytes.to_vec()).map_err(|e| format!("part is not utf-8: {e}"))?
    };

    let items: Vec<&RawValue> = serde_json::from_str(&text).map_err(|e| format!("part is not a JSON array: {e}"))?;
    items
        .into_iter()
        .map(|raw| {
            let Header { id, speckle_type } =
                serde_json::from_str(raw.get()).map_err(|e| format!("object without valid id: {e}"))?;
            Ok(Fragment::new(id, raw.get(), speckle_type))
        })
        .collect()
}

fn preview(line: &str) -> &str {
    let end = line.char_indices().nth(80).map(|(i, _)| i).unwrap_or(line.len());
    &line[..end]
}
