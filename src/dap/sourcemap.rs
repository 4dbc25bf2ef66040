use itertools::Itertools;
use std::collections::HashMap;

/// Path prefix translation between the client view and the debuggee view of sources.
#[derive(Debug, Default, Clone)]
pub struct SourceMap {
    /// Mapping from debuggee paths to the client paths.
    target_to_client: Vec<(String, String)>,
    /// Reverse mapping from client paths to debuggee paths.
    client_to_target: Vec<(String, String)>,
}

impl SourceMap {
    /// Build from a `sourceMap` launch attribute.
    ///
    /// Convention: key = target prefix, value = client prefix.
    pub fn new(entries: &HashMap<String, String>) -> Self {
        let mut sm = SourceMap::default();
        for (target_prefix, client_prefix) in entries {
            sm.target_to_client
                .push((Self::norm_prefix(target_prefix), client_prefix.clone()));
            sm.client_to_target
                .push((Self::norm_prefix(client_prefix), target_prefix.clone()));
        }

        // longest prefix wins
        sm.target_to_client = sm
            .target_to_client
            .into_iter()
            .sorted_by(|a, b| b.0.len().cmp(&a.0.len()))
            .collect();
        sm.client_to_target = sm
            .client_to_target
            .into_iter()
            .sorted_by(|a, b| b.0.len().cmp(&a.0.len()))
            .collect();
        sm
    }

    pub fn is_empty(&self) -> bool {
        self.target_to_client.is_empty()
    }

    pub fn map_target_to_client(&self, target_path: &str) -> String {
        Self::apply_map(target_path, &self.target_to_client)
    }

    pub fn map_client_to_target(&self, client_path: &str) -> String {
        Self::apply_map(client_path, &self.client_to_target)
    }

    fn apply_map(path: &str, mapping: &[(String, String)]) -> String {
        let normalized = Self::norm_path(path);
        for (from_norm, to_raw) in mapping {
            if let Some(suffix) = normalized.strip_prefix(from_norm.as_str()) {
                return Self::join_with_style(to_raw, suffix);
            }
        }
        path.to_string()
    }

    fn join_with_style(prefix: &str, suffix_norm: &str) -> String {
        if suffix_norm.is_empty() {
            return prefix.to_string();
        }
        let mut out = prefix.to_string();
        let backslash = out.contains('\\');

        if !out.ends_with('/') && !out.ends_with('\\') {
            out.push(if backslash { '\\' } else { '/' });
        }

        if backslash {
            out.push_str(&suffix_norm.replace('/', "\\"));
        } else {
            out.push_str(suffix_norm);
        }
        out
    }

    fn norm_prefix(s: &str) -> String {
        let mut out = Self::norm_path(s);
        if !out.ends_with('/') {
            out.push('/');
        }
        out
    }

    fn norm_path(s: &str) -> String {
        s.replace('\\', "/")
    }
}
