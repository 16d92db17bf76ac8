// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Property test for the size-bounded random-eviction invariant (F1 §8):
//! inserting N>S keys into a cache of capacity S always leaves exactly S
//! resident entries, regardless of insertion order or which keys repeat.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nozzle_core::appclient::AppLookup;
use nozzle_core::cache::{AppInfo, AppInfoCache, CacheConfig};
use proptest::prelude::*;

struct UnusedLookup;

#[async_trait]
impl AppLookup for UnusedLookup {
    async fn list_all(&self) -> anyhow::Result<Vec<AppInfo>> {
        Ok(vec![])
    }
    async fn lookup_one(&self, guid: &str) -> anyhow::Result<AppInfo> {
        Ok(AppInfo { guid: guid.to_string(), name: "n".to_string(), space: "s".to_string(), org: "o".to_string() })
    }
}

fn app(guid: &str) -> AppInfo {
    AppInfo { guid: guid.to_string(), name: "n".to_string(), space: "s".to_string(), org: "o".to_string() }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn final_size_never_exceeds_capacity(
        capacity in 1usize..20,
        insert_count in 1usize..200,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let cache = AppInfoCache::new(
                CacheConfig { capacity, enable_preload: false, ..CacheConfig::default() },
                Arc::new(UnusedLookup),
            );
            for i in 0..insert_count {
                cache.set(&format!("G{i}"), app(&format!("G{i}")), Duration::from_secs(3600));
            }
            prop_assert!(cache.len() <= capacity);
            if insert_count >= capacity {
                prop_assert_eq!(cache.len(), capacity);
            }
            Ok(())
        })?;
    }
}
