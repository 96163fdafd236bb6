// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::sync::Arc;

use crate::runtime::mem_tracker::MemTracker;

/// Location of one serialized key inside [`RowStorage`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct RowKey {
    page: u32,
    offset: u32,
    len: u32,
}

/// Paged byte arena for serialized keys. Keys are immutable once written, so
/// readers can hold `RowKey`s across inserts without invalidation.
pub(crate) struct RowStorage {
    pages: Vec<Vec<u8>>,
    page_size: usize,
    mem_tracker: Option<Arc<MemTracker>>,
    accounted_bytes: i64,
}

impl RowStorage {
    pub(crate) fn new(page_size: usize) -> Self {
        Self {
            pages: Vec::new(),
            page_size: page_size.max(1024),
            mem_tracker: None,
            accounted_bytes: 0,
        }
    }

    pub(crate) fn set_mem_tracker(&mut self, tracker: Arc<MemTracker>) {
        if let Some(current) = self.mem_tracker.as_ref() {
            current.release(self.accounted_bytes);
        }
        let bytes = self.tracked_bytes();
        tracker.consume(bytes);
        self.mem_tracker = Some(tracker);
        self.accounted_bytes = bytes;
    }

    pub(crate) fn alloc_copy(&mut self, bytes: &[u8]) -> RowKey {
        let needs_new_page = match self.pages.last() {
            Some(page) => page.len() + bytes.len() > self.page_size.max(bytes.len()),
            None => true,
        };
        if needs_new_page {
            self.pages
                .push(Vec::with_capacity(self.page_size.max(bytes.len())));
        }
        let page_idx = self.pages.len() - 1;
        let page = &mut self.pages[page_idx];
        let offset = page.len();
        page.extend_from_slice(bytes);
        self.refresh_accounting();
        RowKey {
            page: page_idx as u32,
            offset: offset as u32,
            len: bytes.len() as u32,
        }
    }

    pub(crate) fn get(&self, key: RowKey) -> &[u8] {
        let page = &self.pages[key.page as usize];
        &page[key.offset as usize..(key.offset + key.len) as usize]
    }

    pub(crate) fn tracked_bytes(&self) -> i64 {
        let bytes: usize = self.pages.iter().map(|p| p.capacity()).sum();
        i64::try_from(bytes).unwrap_or(i64::MAX)
    }

    fn refresh_accounting(&mut self) {
        let Some(tracker) = self.mem_tracker.as_ref() else {
            return;
        };
        let bytes = self.tracked_bytes();
        let delta = bytes - self.accounted_bytes;
        if delta > 0 {
            tracker.consume(delta);
        } else if delta < 0 {
            tracker.release(-delta);
        }
        self.accounted_bytes = bytes;
    }
}

impl Drop for RowStorage {
    fn drop(&mut self) {
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(self.accounted_bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_keys_round_trip() {
        let mut storage = RowStorage::new(16);
        let a = storage.alloc_copy(b"alpha");
        let b = storage.alloc_copy(b"beta-is-longer-than-one-page");
        let c = storage.alloc_copy(b"c");
        assert_eq!(storage.get(a), b"alpha");
        assert_eq!(storage.get(b), b"beta-is-longer-than-one-page");
        assert_eq!(storage.get(c), b"c");
    }
}
