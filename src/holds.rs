//! Items parked after an unclear agent outcome.
//!
//! An invocation that ends without exactly one recognized marker leaves the
//! item where it is. Without a hold the owning loop would pick it up again
//! next cycle, so the item is parked here until someone releases it with
//! `devloop holds release <item>`.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::agent::Phase;
use crate::board::ItemId;
use crate::records::{AppendLog, ItemRecord, item_line};

const RELEASE_TAG: &str = "release";

pub struct HoldLedger {
    log: AppendLog,
}

impl HoldLedger {
    pub fn new(log: AppendLog) -> Self {
        Self { log }
    }

    /// Park `id` after an unclear `phase` outcome.
    pub fn hold(&self, id: ItemId, phase: Phase, detail: &str) -> Result<()> {
        let detail = detail.replace(['|', '\n'], " ");
        self.log.append(&item_line(id, &[phase.as_str(), detail.trim()]))?;
        tracing::warn!(item = id, phase = %phase, "Item held for manual inspection");
        Ok(())
    }

    pub fn release(&self, id: ItemId) -> Result<()> {
        self.log.append(&item_line(id, &[RELEASE_TAG]))?;
        tracing::info!(item = id, "Hold released");
        Ok(())
    }

    pub fn is_held(&self, id: ItemId) -> Result<bool> {
        Ok(self.held()?.contains_key(&id))
    }

    /// Currently held items with the phase that parked them.
    pub fn held(&self) -> Result<BTreeMap<ItemId, String>> {
        let mut held = BTreeMap::new();
        for record in self.log.lines()?.iter().filter_map(|l| ItemRecord::parse(l)) {
            if record.is_tagged(RELEASE_TAG) {
                held.remove(&record.item);
            } else if let Some(phase) = record.fields.first() {
                held.insert(record.item, phase.clone());
            }
        }
        Ok(held)
    }
}
