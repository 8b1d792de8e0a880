//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::{ClaimId, ItemId};
use crate::ports::Clock;

/// Generates item and claim IDs.
///
/// ULIDs are time-sortable and can be generated without coordination, which
/// keeps IDs unique across the lifetime of a store even after done items are
/// deleted.
pub trait IdGenerator: Send + Sync {
    fn generate_item_id(&self) -> ItemId;

    fn generate_claim_id(&self) -> ClaimId;
}

/// ULID generator whose timestamp part comes from a `Clock`.
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_item_id(&self) -> ItemId {
        ItemId::from(self.next_ulid())
    }

    fn generate_claim_id(&self) -> ClaimId {
        ClaimId::from(self.next_ulid())
    }
}
