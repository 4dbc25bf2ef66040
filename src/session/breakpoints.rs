//! Authoritative breakpoint table.
//!
//! Breakpoints are kept per source file. A `setBreakpoints` request replaces the set
//! of one file: the file entry is checked out of the table (which marks it in-flight),
//! the difference against the previous set is applied through the backend without
//! holding the session lock, and the entry is checked back in.
//!
//! Several requested lines that resolve to the same executable line share one backend
//! installation, counted by reference.

use crate::backend::{BreakpointHandle, BreakpointInstall, LineTable};
use crate::dap::protocol::{Breakpoint, Source};
use crate::dap::Numbering;
use crate::session::error::AdapterError;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Internal line of a requested line that names no line of the file.
pub const INVALID_LINE: u32 = 0;

/// Backend operations needed to install breakpoints.
pub trait Installer {
    fn line_table(&self, source: &str) -> Result<LineTable, AdapterError>;
    fn insert(&self, source: &str, line: u32) -> Result<BreakpointInstall, AdapterError>;
    fn remove(&self, handle: BreakpointHandle) -> Result<(), AdapterError>;
}

/// How a replaced set is applied.
pub enum Apply<'a> {
    /// Install now.
    Live(&'a dyn Installer),
    /// Record only; new breakpoints are reported unverified with an optional message.
    Hold(Option<String>),
}

#[derive(Debug, Clone, PartialEq)]
struct Record {
    id: i64,
    /// Requested line.
    line: u32,
    resolved: Option<u32>,
    /// Key of the installation this record holds a reference on.
    installed_at: Option<u32>,
    verified: bool,
    message: Option<String>,
}

impl Record {
    fn reported_line(&self) -> u32 {
        match self.resolved {
            Some(resolved) if self.verified => resolved,
            _ => self.line,
        }
    }
}

#[derive(Debug, Clone)]
struct Install {
    handle: BreakpointHandle,
    refs: usize,
    verified: bool,
}

/// Result of resolving and installing one requested line.
struct Outcome {
    resolved: Option<u32>,
    installed_at: Option<u32>,
    verified: bool,
    message: Option<String>,
}

/// Breakpoints of one source file.
#[derive(Debug)]
pub struct SourceBreakpoints {
    /// Path as the debuggee sees it.
    path: String,
    /// Source as the client sent it.
    source: Source,
    records: BTreeMap<u32, Record>,
    /// Requested lines of the latest request, in request order.
    order: Vec<u32>,
    installs: BTreeMap<u32, Install>,
    table: Option<LineTable>,
}

impl SourceBreakpoints {
    fn new(path: String, source: Source) -> Self {
        Self {
            path,
            source,
            records: BTreeMap::new(),
            order: vec![],
            installs: BTreeMap::new(),
            table: None,
        }
    }

    fn resolve(&mut self, line: u32, installer: &dyn Installer) -> Result<Option<u32>, AdapterError> {
        if self.table.is_none() {
            self.table = Some(installer.line_table(&self.path)?);
        }
        Ok(self.table.as_ref().and_then(|table| table.resolve(line)))
    }

    fn install(&mut self, line: u32, installer: &dyn Installer) -> Outcome {
        let unverified = |message: String| Outcome {
            resolved: None,
            installed_at: None,
            verified: false,
            message: Some(message),
        };

        if line == INVALID_LINE {
            return unverified("line is out of range".to_string());
        }
        let resolved = match self.resolve(line, installer) {
            Ok(Some(resolved)) => resolved,
            Ok(None) => return unverified(format!("no executable code at or after line {line}")),
            Err(e) => return unverified(e.to_string()),
        };

        if let Some(install) = self.installs.get_mut(&resolved) {
            install.refs += 1;
            return Outcome {
                resolved: Some(resolved),
                installed_at: Some(resolved),
                verified: install.verified,
                message: None,
            };
        }

        match installer.insert(&self.path, resolved) {
            Ok(BreakpointInstall { handle, verified }) => {
                log::debug!(target: "breakpoint", "installed {}:{resolved} as {handle:?}", self.path);
                self.installs.insert(
                    resolved,
                    Install {
                        handle,
                        refs: 1,
                        verified,
                    },
                );
                Outcome {
                    resolved: Some(resolved),
                    installed_at: Some(resolved),
                    verified,
                    message: None,
                }
            }
            Err(e) => unverified(e.to_string()),
        }
    }

    fn release(&mut self, key: u32, installer: Option<&dyn Installer>) {
        let Some(install) = self.installs.get_mut(&key) else {
            return;
        };
        install.refs = install.refs.saturating_sub(1);
        if install.refs > 0 {
            return;
        }
        let handle = install.handle;
        self.installs.remove(&key);
        if let Some(installer) = installer {
            match installer.remove(handle) {
                Ok(()) => log::debug!(target: "breakpoint", "removed {}:{key}", self.path),
                Err(e) => log::warn!(target: "breakpoint", "remove {}:{key}: {e}", self.path),
            }
        }
    }

    fn install_record(&mut self, line: u32, installer: &dyn Installer) {
        let outcome = self.install(line, installer);
        if let Some(record) = self.records.get_mut(&line) {
            record.resolved = outcome.resolved;
            record.installed_at = outcome.installed_at;
            record.verified = record.verified || outcome.verified;
            record.message = outcome.message;
        }
    }

    /// Install every record that holds no installation yet. Returns views of the
    /// records whose reported state changed.
    pub fn install_pending(&mut self, installer: &dyn Installer) -> Vec<BreakpointView> {
        let pending: Vec<Record> = self
            .records
            .values()
            .filter(|r| r.installed_at.is_none())
            .cloned()
            .collect();

        let mut changed = vec![];
        for before in pending {
            self.install_record(before.line, installer);
            if let Some(after) = self.records.get(&before.line) {
                if after.verified != before.verified
                    || after.reported_line() != before.reported_line()
                    || after.message != before.message
                {
                    changed.push(self.view(after));
                }
            }
        }
        changed
    }

    /// Breakpoints in the order of the latest request.
    pub fn views(&self) -> Vec<BreakpointView> {
        self.order
            .iter()
            .filter_map(|line| self.records.get(line))
            .map(|r| self.view(r))
            .collect()
    }

    fn view(&self, record: &Record) -> BreakpointView {
        BreakpointView {
            id: record.id,
            verified: record.verified,
            line: record.reported_line(),
            message: record.message.clone(),
            source: self.source.clone(),
        }
    }

    fn on_resolved(&mut self, handle: BreakpointHandle, line: u32) -> Option<Vec<BreakpointView>> {
        let (&key, install) = self.installs.iter_mut().find(|(_, i)| i.handle == handle)?;
        install.verified = true;

        let mut changed = vec![];
        let lines: Vec<u32> = self
            .records
            .values()
            .filter(|r| r.installed_at == Some(key) && (!r.verified || r.resolved != Some(line)))
            .map(|r| r.line)
            .collect();
        for requested in lines {
            if let Some(record) = self.records.get_mut(&requested) {
                record.verified = true;
                record.resolved = Some(line);
                record.message = None;
            }
            if let Some(record) = self.records.get(&requested) {
                changed.push(self.view(record));
            }
        }
        Some(changed)
    }

    fn hit_ids(&self, handles: &[BreakpointHandle]) -> Vec<i64> {
        let keys: BTreeSet<u32> = self
            .installs
            .iter()
            .filter(|(_, i)| handles.contains(&i.handle))
            .map(|(k, _)| *k)
            .collect();
        self.records
            .values()
            .filter(|r| r.installed_at.is_some_and(|k| keys.contains(&k)))
            .map(|r| r.id)
            .collect()
    }
}

/// A breakpoint as reported to the client, lines in internal numbering.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakpointView {
    pub id: i64,
    pub verified: bool,
    pub line: u32,
    pub message: Option<String>,
    pub source: Source,
}

impl BreakpointView {
    pub fn to_protocol(&self, numbering: Numbering) -> Breakpoint {
        Breakpoint {
            id: self.id,
            verified: self.verified,
            message: self.message.clone(),
            source: Some(self.source.clone()),
            line: Some(numbering.line_to_client(self.line)),
        }
    }
}

/// A source entry taken out of the table for a full-replace update.
pub struct Checkout {
    pub entry: SourceBreakpoints,
    added: Vec<u32>,
    removed: Vec<Record>,
}

impl Checkout {
    /// Apply the difference computed at checkout. Unchanged breakpoints are left
    /// alone. Additions go first, so a line that stays requested under another
    /// requested line keeps its installation.
    pub fn apply(&mut self, mode: Apply<'_>) {
        let entry = &mut self.entry;
        match mode {
            Apply::Live(installer) => {
                for line in self.added.drain(..) {
                    entry.install_record(line, installer);
                }
                for record in self.removed.drain(..) {
                    if let Some(key) = record.installed_at {
                        entry.release(key, Some(installer));
                    }
                }
            }
            Apply::Hold(message) => {
                for line in self.added.drain(..) {
                    if let Some(record) = entry.records.get_mut(&line) {
                        record.message = message.clone();
                    }
                }
                for record in self.removed.drain(..) {
                    if let Some(key) = record.installed_at {
                        entry.release(key, None);
                    }
                }
            }
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct BreakpointManager {
    next_id: i64,
    sources: HashMap<String, SourceBreakpoints>,
    in_flight: HashSet<String>,
    /// Resolutions that arrived while their source was checked out.
    deferred: Vec<(BreakpointHandle, u32)>,
}

impl BreakpointManager {
    /// Take the entry of `path` out of the table and compute the difference between
    /// its current set and `requested` (internal line numbers).
    ///
    /// Fails while another update of the same file is in flight.
    pub fn checkout(
        &mut self,
        path: &str,
        source: Source,
        requested: &[u32],
    ) -> Result<Checkout, AdapterError> {
        if !self.in_flight.insert(path.to_string()) {
            return Err(AdapterError::BreakpointsInFlight(path.to_string()));
        }

        let mut entry = self
            .sources
            .remove(path)
            .unwrap_or_else(|| SourceBreakpoints::new(path.to_string(), source.clone()));
        entry.source = source;

        let wanted: BTreeSet<u32> = requested.iter().copied().collect();
        let stale: Vec<u32> = entry
            .records
            .keys()
            .filter(|line| !wanted.contains(line))
            .copied()
            .collect();
        let removed = stale
            .into_iter()
            .filter_map(|line| entry.records.remove(&line))
            .collect();

        let mut added = vec![];
        for line in wanted {
            if entry.records.contains_key(&line) {
                continue;
            }
            self.next_id += 1;
            entry.records.insert(
                line,
                Record {
                    id: self.next_id,
                    line,
                    resolved: None,
                    installed_at: None,
                    verified: false,
                    message: None,
                },
            );
            added.push(line);
        }
        entry.order = requested.to_vec();

        Ok(Checkout {
            entry,
            added,
            removed,
        })
    }

    /// Put an entry back and release its in-flight mark. Returns breakpoints changed
    /// by resolutions that arrived in the meantime.
    pub fn checkin(&mut self, checkout: Checkout) -> Vec<BreakpointView> {
        let entry = checkout.entry;
        self.in_flight.remove(&entry.path);
        self.sources.insert(entry.path.clone(), entry);

        let deferred = std::mem::take(&mut self.deferred);
        deferred
            .into_iter()
            .flat_map(|(handle, line)| self.on_resolved(handle, line))
            .collect()
    }

    /// Check out every source that is not being updated, used to install held
    /// breakpoints at the end of the configuration sequence.
    pub fn checkout_all(&mut self) -> Vec<Checkout> {
        let paths: Vec<String> = self
            .sources
            .keys()
            .filter(|path| !self.in_flight.contains(*path))
            .cloned()
            .collect();
        paths
            .into_iter()
            .filter_map(|path| {
                let entry = self.sources.remove(&path)?;
                self.in_flight.insert(path);
                Some(Checkout {
                    entry,
                    added: vec![],
                    removed: vec![],
                })
            })
            .collect()
    }

    /// A late resolution from the backend. Flips the affected breakpoints to verified.
    pub fn on_resolved(&mut self, handle: BreakpointHandle, line: u32) -> Vec<BreakpointView> {
        for entry in self.sources.values_mut() {
            if let Some(changed) = entry.on_resolved(handle, line) {
                return changed;
            }
        }
        if !self.in_flight.is_empty() {
            self.deferred.push((handle, line));
        } else {
            log::debug!(target: "breakpoint", "resolution of unknown {handle:?} ignored");
        }
        vec![]
    }

    /// Ids of breakpoints behind the given backend handles.
    pub fn hit_ids(&self, handles: &[BreakpointHandle]) -> Vec<i64> {
        if handles.is_empty() {
            return vec![];
        }
        let mut ids: Vec<i64> = self
            .sources
            .values()
            .flat_map(|entry| entry.hit_ids(handles))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Forget backend installations once the debuggee is gone. Requested sets stay.
    pub fn debuggee_gone(&mut self) {
        for entry in self.sources.values_mut() {
            entry.installs.clear();
            entry.table = None;
            for record in entry.records.values_mut() {
                record.installed_at = None;
            }
        }
    }
}
