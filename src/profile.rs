use crate::ident::{IndomId, InstId};

/// Global or per-indom include/exclude disposition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileState {
    /// All instances selected except those listed.
    IncludeAll,
    /// No instances selected except those listed.
    ExcludeAll,
}

impl ProfileState {
    pub fn as_raw(self) -> i32 {
        match self {
            ProfileState::IncludeAll => 0,
            ProfileState::ExcludeAll => 1,
        }
    }

    pub fn from_raw(raw: i32) -> crate::error::Result<ProfileState> {
        match raw {
            0 => Ok(ProfileState::IncludeAll),
            1 => Ok(ProfileState::ExcludeAll),
            _ => Err(crate::error::Error::Ipc("bad profile state")),
        }
    }
}

/// The instance filter for one instance domain.  Instances preserve the
/// order in which the caller added them.
#[derive(Clone, Debug, PartialEq)]
pub struct IndomProfile {
    pub indom: IndomId,
    pub state: ProfileState,
    pub instances: Vec<InstId>,
}

/// Per-context filter specifying which instances of each indom a fetch
/// should return.
#[derive(Clone, Debug, PartialEq)]
pub struct Profile {
    pub state: ProfileState,
    pub entries: Vec<IndomProfile>,
}

impl Default for Profile {
    fn default() -> Profile {
        Profile {
            state: ProfileState::IncludeAll,
            entries: Vec::new(),
        }
    }
}

impl Profile {
    /// Select everything; drops all per-indom entries.
    pub fn include_all(&mut self) {
        self.state = ProfileState::IncludeAll;
        self.entries.clear();
    }

    /// Deselect everything; drops all per-indom entries.
    pub fn exclude_all(&mut self) {
        self.state = ProfileState::ExcludeAll;
        self.entries.clear();
    }

    pub fn find(&self, indom: IndomId) -> Option<&IndomProfile> {
        self.entries.iter().find(|e| e.indom == indom)
    }

    fn entry_mut(&mut self, indom: IndomId) -> &mut IndomProfile {
        if let Some(pos) = self.entries.iter().position(|e| e.indom == indom) {
            return &mut self.entries[pos];
        }
        // new per-indom entries inherit the inverse of the global state,
        // listing the exceptions
        let state = match self.state {
            ProfileState::IncludeAll => ProfileState::ExcludeAll,
            ProfileState::ExcludeAll => ProfileState::IncludeAll,
        };
        self.entries.push(IndomProfile {
            indom,
            state,
            instances: Vec::new(),
        });
        self.entries.last_mut().unwrap()
    }

    /// Add instances to the selection for `indom`.  With an empty list
    /// the whole indom is selected.
    pub fn add_indom(&mut self, indom: IndomId, instances: &[InstId]) {
        if instances.is_empty() {
            let entry = self.entry_mut(indom);
            entry.state = ProfileState::IncludeAll;
            entry.instances.clear();
            return;
        }
        let global = self.state;
        let entry = self.entry_mut(indom);
        match (global, entry.state) {
            // exceptions list is "included" instances
            (_, ProfileState::IncludeAll) => {
                // removing from the exclusion list would be the dual; an
                // include-all entry with explicit adds keeps everything
                for inst in instances {
                    entry.instances.retain(|i| i != inst);
                }
            }
            (_, ProfileState::ExcludeAll) => {
                for inst in instances {
                    if !entry.instances.contains(inst) {
                        entry.instances.push(*inst);
                    }
                }
            }
        }
    }

    /// Remove instances from the selection for `indom`.  With an empty
    /// list the whole indom is deselected.
    pub fn del_indom(&mut self, indom: IndomId, instances: &[InstId]) {
        if instances.is_empty() {
            let entry = self.entry_mut(indom);
            entry.state = ProfileState::ExcludeAll;
            entry.instances.clear();
            return;
        }
        let entry = self.entry_mut(indom);
        match entry.state {
            ProfileState::IncludeAll => {
                for inst in instances {
                    if !entry.instances.contains(inst) {
                        entry.instances.push(*inst);
                    }
                }
            }
            ProfileState::ExcludeAll => {
                for inst in instances {
                    entry.instances.retain(|i| i != inst);
                }
            }
        }
    }

    /// Would a fetch through this profile return `inst` of `indom`?
    pub fn selected(&self, indom: IndomId, inst: InstId) -> bool {
        match self.find(indom) {
            None => self.state == ProfileState::IncludeAll,
            Some(entry) => match entry.state {
                ProfileState::IncludeAll => !entry.instances.contains(&inst),
                ProfileState::ExcludeAll => entry.instances.contains(&inst),
            },
        }
    }
}
