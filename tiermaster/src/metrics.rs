// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of tiermaster.
//
// tiermaster is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// tiermaster is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with tiermaster.  If not,
// see <http://www.gnu.org/licenses/>.

//! # tiermaster metrics
//!
//! # Introduction
//!
//! tiermaster uses [OpenTelemetry] to collect metrics, and exports them in Prometheus text format.
//! OTel calls counters, gauges & so forth "instruments", and asks that they be built once & re-used.
//! Keeping them all as fields on the application state is clumsy, and a map from metric name to
//! instrument pushes type errors off to runtime. On top of that, two call sites could accidentally
//! claim the same metric name, and nothing short of a centralized list would catch it.
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html
//!
//! # Defining metrics
//!
//! Declare a metric next to the code that records it:
//!
//! ```ignore
//! define_metric! { "leaderboard.submissions.accepted", submissions_accepted, Sort::IntegralCounter }
//! // ...
//! async fn submit() {
//!     // ...
//!     submissions_accepted.add(1, &[]);
//! }
//! ```
//!
//! The macro does two things: it registers the name (via David Tolnay's [inventory] crate), and it
//! defines a lazily-built, statically-typed instrument. The binaries call [check_metric_names] at
//! startup, which fails if any name was registered twice.
//!
//! Instruments are built from the global meter provider the first time they're touched, so the
//! provider must be installed (by [init_telemetry]) before any request is served. Until it is (in
//! unit tests, e.g.), the global provider is a no-op & recording is harmless.
//!
//! # Export
//!
//! [init_telemetry] hooks the OTel SDK up to a [prometheus::Registry]; serving `/metrics` is then
//! just a matter of [render]ing that registry in the Prometheus text format.

use std::collections::HashSet;

use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{metrics::SdkMeterProvider, Resource};
use prometheus::Encoder;
use snafu::{prelude::*, Backtrace};
use tracing::debug;

/// The name of the OTel meter from which all tiermaster instruments are built
pub const METER: &str = "tiermaster";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The metric name {name} was registered more than once"))]
    DuplicateMetric {
        name: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to encode metrics: {source}"))]
    Encode {
        source: prometheus::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to build the Prometheus exporter: {message}"))]
    Exporter {
        message: String,
        backtrace: Backtrace,
    },
    #[snafu(display("The Prometheus text encoder produced non-UTF-8 output: {source}"))]
    NotUtf8 {
        source: std::string::FromUtf8Error,
        backtrace: Backtrace,
    },
}

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// Corresponds to `Counter<u64>`
    IntegralCounter,
}

/// The type of thing being inventoried
///
/// You'll rarely build these by hand; [define_metric] does it for you.
///
/// [define_metric]: crate::define_metric
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Verify that no two metric definitions share a name
pub fn check_metric_names() -> Result<(), Error> {
    let mut names: HashSet<&'static str> = HashSet::new();
    IntoIterator::into_iter(inventory::iter::<Registration>).try_for_each(
        |reg| -> Result<(), Error> {
            ensure!(names.insert(reg.name()), DuplicateMetricSnafu { name: reg.name() });
            debug!("Metric {} registered as {:?}", reg.name(), reg.sort());
            Ok(())
        },
    )
}

/// Initialize telemetry
///
/// <div class="warning">
///
/// This must be invoked before any instruments are touched, and only once per process: it
/// replaces the global meter provider.
///
/// </div>
///
/// Check our metric registrations, then build a meter provider whose single reader is a Prometheus
/// exporter. Everything recorded through the global meter lands in the returned registry, tagged
/// with `service.name` = `service`.
pub fn init_telemetry(service: &str) -> Result<prometheus::Registry, Error> {
    check_metric_names()?;
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .map_err(|err| {
            ExporterSnafu {
                message: err.to_string(),
            }
            .build()
        })?;
    let provider = SdkMeterProvider::builder()
        .with_reader(exporter)
        .with_resource(Resource::new([KeyValue::new(
            "service.name",
            service.to_owned(),
        )]))
        .build();
    global::set_meter_provider(provider);
    Ok(registry)
}

/// Render `registry` in the Prometheus text exposition format
pub fn render(registry: &prometheus::Registry) -> Result<String, Error> {
    let mut buf = Vec::new();
    prometheus::TextEncoder::new()
        .encode(&registry.gather(), &mut buf)
        .context(EncodeSnafu)?;
    String::from_utf8(buf).context(NotUtf8Snafu)
}

/// Build an OTel-legal instrument name from an HTTP method & path
///
/// OTel names are limited to ASCII alphanumerics, '_', '.', '-' & '/'. We drop anything else and
/// map '/' to '.', so that `GET /rank/{user_id}` becomes `http.get.rank.user_id`.
pub fn request_metric_name(method: &str, path: &str) -> String {
    let stem: String = path
        .chars()
        .filter_map(|c| match c {
            '/' => Some('.'),
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' => Some(c),
            _ => None,
        })
        .collect();
    format!("http.{}{}", method.to_lowercase(), stem)
}

/// Define a metric: register its name & declare a lazily-built static instrument
#[macro_export]
macro_rules! define_metric {
    ($name:literal, $ident:ident, Sort::IntegralCounter) => {
        ::inventory::submit! {
            $crate::metrics::Registration::new($name, $crate::metrics::Sort::IntegralCounter)
        }
        #[allow(non_upper_case_globals)]
        static $ident: ::std::sync::LazyLock<::opentelemetry::metrics::Counter<u64>> =
            ::std::sync::LazyLock::new(|| {
                ::opentelemetry::global::meter($crate::metrics::METER)
                    .u64_counter($name)
                    .build()
            });
    };
}
