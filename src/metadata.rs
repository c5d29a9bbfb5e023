//! Component versions and build features reported on the process object.

use std::collections::BTreeMap;

pub const RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versions(BTreeMap<&'static str, String>);

impl Versions {
    pub fn new(engine_name: &'static str, engine_version: &str) -> Self {
        let mut versions = BTreeMap::new();
        versions.insert("openworkers", RUNTIME_VERSION.to_string());
        versions.insert("tokio", "1".to_string());

        if !engine_version.is_empty() {
            versions.insert(engine_name, engine_version.to_string());
        }

        Self(versions)
    }

    pub fn get(&self, component: &str) -> Option<&str> {
        self.0.get(component).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    pub debug: bool,
    pub v8: bool,
    pub inspector: bool,
    pub ipv6: bool,
    pub tracing: bool,
}

impl Features {
    pub fn current() -> Self {
        Self {
            debug: cfg!(debug_assertions),
            v8: cfg!(feature = "v8"),
            inspector: false,
            ipv6: true,
            tracing: true,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, bool)> {
        [
            ("debug", self.debug),
            ("v8", self.v8),
            ("inspector", self.inspector),
            ("ipv6", self.ipv6),
            ("tracing", self.tracing),
        ]
        .into_iter()
    }
}
