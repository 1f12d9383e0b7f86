//! In-memory table of managed processes. Single source of truth for state;
//! all mutation happens through the supervisor, which owns the registry.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;

use crate::errors::RemusError;
use crate::process::ManagedProcess;

#[derive(Debug)]
pub struct Registry {
    processes: HashMap<String, ManagedProcess>,
    next_id: u64,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            processes: HashMap::new(),
            next_id: 1,
        }
    }
}

impl Registry {
    pub fn new(next_id: u64) -> Self {
        Self {
            processes: HashMap::new(),
            next_id: next_id.max(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.saturating_add(1);
        id
    }

    /// Insert by name; keeps the id counter ahead of any explicit id, so
    /// reloading a persisted registry cannot hand out duplicates.
    pub fn insert(&mut self, process: ManagedProcess) {
        self.next_id = self.next_id.max(process.id.saturating_add(1));
        self.processes.insert(process.name.clone(), process);
    }

    pub fn remove(&mut self, name: &str) -> Option<ManagedProcess> {
        self.processes.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.processes.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ManagedProcess> {
        self.processes.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ManagedProcess> {
        self.processes.get_mut(name)
    }

    pub fn values(&self) -> impl Iterator<Item = &ManagedProcess> {
        self.processes.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut ManagedProcess> {
        self.processes.values_mut()
    }

    /// Snapshot of every process, ordered by id for stable output.
    pub fn list(&self) -> Vec<ManagedProcess> {
        let mut list: Vec<ManagedProcess> = self.processes.values().cloned().collect();
        list.sort_by_key(|process| process.id);
        list
    }

    /// Resolve a single target given as a name or numeric id.
    pub fn resolve(&self, target: &str) -> Result<String> {
        if self.processes.contains_key(target) {
            return Ok(target.to_string());
        }

        if let Ok(id) = target.parse::<u64>() {
            if let Some(name) = self
                .processes
                .values()
                .find(|process| process.id == id)
                .map(|process| process.name.clone())
            {
                return Ok(name);
            }
        }

        Err(RemusError::ProcessNotFound(target.to_string()).into())
    }

    /// Resolve a target selector: a name, a numeric id, or `all`.
    pub fn resolve_many(&self, target: &str) -> Result<Vec<String>> {
        if target == "all" {
            let mut entries: Vec<(u64, String)> = self
                .processes
                .values()
                .map(|process| (process.id, process.name.clone()))
                .collect();
            entries.sort_by_key(|(id, _)| *id);
            return Ok(entries.into_iter().map(|(_, name)| name).collect());
        }
        Ok(vec![self.resolve(target)?])
    }

    /// Derive a unique name from the command stem when none was given.
    pub fn auto_name(&self, command: &str) -> String {
        let stem = Path::new(command)
            .file_stem()
            .and_then(|value| value.to_str())
            .unwrap_or("process");
        let base = sanitize_name(stem);

        if !self.processes.contains_key(&base) {
            return base;
        }

        let mut suffix = 1_u64;
        loop {
            let candidate = format!("{base}-{suffix}");
            if !self.processes.contains_key(&candidate) {
                return candidate;
            }
            suffix = suffix.saturating_add(1);
        }
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RemusError::InvalidProcessName("name cannot be empty".to_string()).into());
    }

    let valid = name != "all"
        && name.parse::<u64>().is_err()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');

    if !valid {
        return Err(RemusError::InvalidProcessName(name.to_string()).into());
    }
    Ok(())
}

fn sanitize_name(input: &str) -> String {
    let value: String = input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '-'
            }
        })
        .collect();

    let trimmed = value.trim_matches('-');
    if trimmed.is_empty() || trimmed.parse::<u64>().is_ok() {
        "process".to_string()
    } else {
        trimmed.to_ascii_lowercase()
    }
}
