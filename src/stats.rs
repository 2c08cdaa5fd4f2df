// Copyright (C) 2023 Ant Group CO., Ltd. All rights reserved.
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

#![allow(dead_code)]

#[cfg(feature = "stats")]
pub use _stats::*;

#[cfg(not(feature = "stats"))]
pub use _stats_empty::*;

#[cfg(feature = "stats")]
mod _stats {
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    pub struct StatsValue {
        count: AtomicU64,
        sum: AtomicU64,
    }

    impl StatsValue {
        pub const fn new() -> Self {
            Self {
                count: AtomicU64::new(0),
                sum: AtomicU64::new(0),
            }
        }

        pub fn atomic_add(&self, value: u64) {
            self.count.fetch_add(1, Ordering::Release);
            self.sum.fetch_add(value, Ordering::Release);
        }

        pub fn atomic_reset(&self) {
            self.count.store(0, Ordering::Release);
            self.sum.store(0, Ordering::Release);
        }

        pub fn count(&self) -> u64 {
            self.count.load(Ordering::Acquire)
        }

        pub fn as_string(&self) -> String {
            let sum = self.sum.load(Ordering::Acquire);
            let count = self.count.load(Ordering::Acquire);
            let ave = if count == 0 { 0 } else { sum * 1000 / count };
            format!(
                "count = {}, sum = {}ns, average = {}.{:03}ns",
                count,
                sum,
                ave / 1000,
                ave % 1000
            )
        }
    }

    pub struct Instant {
        timestamp: std::time::Instant,
    }

    impl Instant {
        pub fn now() -> Self {
            Self {
                timestamp: std::time::Instant::now(),
            }
        }

        /// Nanoseconds since `now()`.
        pub fn elapsed(&self) -> u64 {
            self.timestamp.elapsed().as_nanos() as u64
        }
    }
}

#[cfg(not(feature = "stats"))]
mod _stats_empty {
    #[derive(Default)]
    pub struct StatsValue;
    impl StatsValue {
        pub const fn new() -> Self {
            Self
        }
        pub fn atomic_add(&self, _value: u64) {}
        pub fn atomic_reset(&self) {}
        pub fn count(&self) -> u64 {
            0
        }
        pub fn as_string(&self) -> String {
            String::from("disabled")
        }
    }

    pub struct Instant;
    impl Instant {
        pub fn now() -> Self {
            Self
        }
        pub fn elapsed(&self) -> u64 {
            0
        }
    }
}

#[cfg(all(test, feature = "stats"))]
mod test {
    use super::*;

    #[test]
    fn test_stats() {
        let stats = StatsValue::new();
        let now = Instant::now();
        std::thread::sleep(std::time::Duration::from_millis(1));
        stats.atomic_add(now.elapsed());
        stats.atomic_add(0);
        assert_eq!(stats.count(), 2);
        assert!(stats.as_string().starts_with("count = 2"));
        stats.atomic_reset();
        assert_eq!(stats.count(), 0);
    }
}
