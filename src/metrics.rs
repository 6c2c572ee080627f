// Copyright (C) 2025 the chronicle authors
//
// This file is part of chronicle.
//
// chronicle is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// chronicle is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with chronicle.  If not,
// see <http://www.gnu.org/licenses/>.

//! # metrics
//!
//! OTel instruments are designed for reuse, but nobody tells you where to keep them; littering
//! the application state type with dozens of `Counter<u64>` fields gets old fast, and a stringly
//! keyed map re-introduces the footgun of two call sites accidentally sharing a name (or
//! disagreeing about the instrument's type).
//!
//! This module leans on Tolnay's [inventory] crate instead: each collection site registers its
//! metric name & sort next to the code that records it:
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("dispatcher.requests.applied", Sort::IntegralCounter) }
//! // ...
//! counter_add!(instruments, "dispatcher.requests.applied", 1, &[]);
//! ```
//!
//! [Instruments::new] pre-builds every registered instrument & panics on a name clash, so the
//! mistakes this design can't rule out at compile time at least announce themselves at startup
//! rather than in a little-used code path.

use std::collections::{hash_map::Entry, HashMap, HashSet};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge},
    KeyValue,
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// Corresponds to `Counter<u64>`
    IntegralCounter,
    /// `Gauge<u64>`
    IntegralGauge,
}

/// One registered metric: a name & its instrument sort.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> String {
        self.name.to_string()
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Panic at startup if two collection sites registered the same metric name.
pub fn check_metric_registrations() {
    let mut names: HashSet<String> = HashSet::new();
    IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
        if !names.insert(reg.name()) {
            panic!("The metric name {} was registered twice", reg.name());
        }
    });
}

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeU64(Gauge<u64>),
}

/// Container for OTel instruments
pub struct Instruments {
    map: HashMap<String, Instrument>,
}

impl Instruments {
    /// Pre-build every registered instrument; `add` & `recordu` then need only `&self`, so an
    /// instance can live in an `Arc` on the application state.
    pub fn new(prefix: &'static str) -> Instruments {
        let mut m: HashMap<String, Instrument> = HashMap::new();
        let meter = global::meter(prefix);
        IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
            let name = reg.name();
            match m.entry(reg.name()) {
                Entry::Occupied(_) => {
                    panic!("The metric name {} was used twice", name)
                }
                Entry::Vacant(vacant_entry) => {
                    vacant_entry.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(name).build())
                        }
                        Sort::IntegralGauge => Instrument::GaugeU64(meter.u64_gauge(name).build()),
                    });
                }
            }
        });

        Instruments { map: m }
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::CounterU64(c)) = self.map.get(name) {
            c.add(count, attributes);
        } else {
            panic!("{} does not name a counter", name);
        }
    }
    // panics if `name` doesn't name a gauge
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        if let Some(Instrument::GaugeU64(g)) = self.map.get(name) {
            g.record(value, attributes);
        } else {
            panic!("{} does not name a gauge", name);
        }
    }
}

// No trailing semicolon in the expansions: these are invoked in expression position (match
// arms) as well as as statements.
#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs)
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs)
    };
}

#[cfg(test)]
mod test {
    use super::*;

    inventory::submit! { Registration::new("metrics.test.count", Sort::IntegralCounter) }
    inventory::submit! { Registration::new("metrics.test.level", Sort::IntegralGauge) }

    // The recording macros are used in match arms; they must expand to expressions, not
    // statements.
    #[test]
    fn macros_work_in_expression_position() {
        let instruments = Instruments::new("chronicle");
        for which in [true, false] {
            match which {
                true => crate::counter_add!(instruments, "metrics.test.count", 1, &[]),
                false => crate::gauge_setu!(instruments, "metrics.test.level", 1, &[]),
            }
        }
    }
}
