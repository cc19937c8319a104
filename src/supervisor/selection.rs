// src/supervisor/selection.rs

use crate::errors::{LaunchError, Result};
use crate::types::ServiceId;

/// Which services a control request applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Services(Vec<ServiceId>),
}

impl Selection {
    pub fn one(id: impl Into<ServiceId>) -> Self {
        Selection::Services(vec![id.into()])
    }

    /// `All` for an empty list, otherwise the listed services.
    pub fn from_ids(ids: Vec<ServiceId>) -> Self {
        if ids.is_empty() {
            Selection::All
        } else {
            Selection::Services(ids)
        }
    }

    /// Resolve against the known ids, preserving request order and
    /// dropping duplicates.
    pub fn resolve<'a>(&self, known: impl IntoIterator<Item = &'a str>) -> Resolved {
        let known: Vec<&str> = known.into_iter().collect();
        match self {
            Selection::All => Resolved {
                services: known.iter().map(|s| s.to_string()).collect(),
                unknown: Vec::new(),
            },
            Selection::Services(ids) => {
                let mut resolved = Resolved::default();
                for id in ids {
                    if resolved.services.contains(id) || resolved.unknown.contains(id) {
                        continue;
                    }
                    if known.contains(&id.as_str()) {
                        resolved.services.push(id.clone());
                    } else {
                        resolved.unknown.push(id.clone());
                    }
                }
                resolved
            }
        }
    }
}

impl From<Vec<ServiceId>> for Selection {
    fn from(ids: Vec<ServiceId>) -> Self {
        Selection::from_ids(ids)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    pub services: Vec<ServiceId>,
    pub unknown: Vec<ServiceId>,
}

impl Resolved {
    /// Fail on the first unknown id.
    pub fn require_known(self) -> Result<Vec<ServiceId>> {
        match self.unknown.into_iter().next() {
            Some(id) => Err(LaunchError::UnknownService(id)),
            None => Ok(self.services),
        }
    }
}
