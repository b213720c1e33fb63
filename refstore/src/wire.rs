//! Wire types for the object-API surface, mirroring `gcsfuse`'s
//! `object_client::http` expectations field-for-field.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireObject {
    pub bucket: String,
    pub name: String,
    pub generation: u64,
    pub meta_generation: u64,
    pub size: u64,
    pub content_type: String,
    pub updated_at_unix: i64,
    pub md5: Option<String>,
    pub crc32c: Option<u32>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WireListPage {
    pub objects: Vec<WireObject>,
    pub subdirs: Vec<String>,
    pub next_continuation: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ComposeRequest {
    pub dest: String,
    pub parts: Vec<ComposeSourceWire>,
}

#[derive(Debug, Deserialize)]
pub struct ComposeSourceWire {
    pub name: String,
    pub generation: u64,
}

#[derive(Debug, Deserialize, Default)]
pub struct PreconditionQuery {
    pub if_generation_match: Option<u64>,
    pub if_metageneration_match: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub continuation: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StatQuery {
    pub stat: Option<String>,
    pub generation: Option<u64>,
}
