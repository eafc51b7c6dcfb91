// Copyright 2023 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use outflow_common::types::{Actor, Delivery, ExportId, ExportRequest};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Stable signature of a logically-identical request: SHA-256 over the
/// caller's key, the actor identity and scope, and a canonical fingerprint
/// of the request with volatile fields removed.
pub fn request_signature(key: &str, actor: &Actor, request: &ExportRequest) -> String {
    let mut fingerprint = request.clone();
    fingerprint.delivery = Delivery::Async;
    fingerprint.idempotency_key = None;

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    hasher.update(actor.id.as_bytes());
    hasher.update([0u8]);
    // Struct serialization order is stable, so the JSON text is canonical.
    hasher.update(serde_json::to_vec(&actor.scope).expect("scope serializes"));
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(&fingerprint).expect("request serializes"));
    hex::encode(hasher.finalize())
}

/// Maps request signatures to the export they already created, with a TTL.
pub trait IdempotencyStore: Send + Sync {
    fn get(&self, signature: &str) -> Option<ExportId>;

    fn put(&self, signature: &str, id: ExportId, ttl: Duration);

    fn remove(&self, signature: &str);
}

/// Mutex-guarded map with lazy expiry.
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    entries: Mutex<HashMap<String, (ExportId, Instant)>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdempotencyStore for MemoryIdempotencyStore {
    fn get(&self, signature: &str) -> Option<ExportId> {
        let mut entries = self.entries.lock();
        match entries.get(signature) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                entries.remove(signature);
                None
            }
            Some((id, _)) => Some(id.clone()),
            None => None,
        }
    }

    fn put(&self, signature: &str, id: ExportId, ttl: Duration) {
        self.entries
            .lock()
            .insert(signature.to_owned(), (id, Instant::now() + ttl));
    }

    fn remove(&self, signature: &str) {
        self.entries.lock().remove(signature);
    }
}
