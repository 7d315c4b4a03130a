use ethers::types::H256;
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage layout of a contract, in the shape solc emits under `storageLayout`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLayout {
    /// Declared state variables in declaration order
    #[serde(default)]
    pub storage: Vec<StorageEntry>,
}

/// One persistent state variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    /// Variable name
    pub label: String,
    /// Slot index
    #[serde(with = "crate::utils::slot_number")]
    pub slot: u64,
    /// Byte offset inside the slot
    #[serde(default)]
    pub offset: u32,
    /// solc type identifier, e.g. `t_uint256`
    #[serde(rename = "type")]
    pub type_name: String,
}

impl StorageEntry {
    pub fn new(label: &str, slot: u64, offset: u32, type_name: &str) -> Self {
        Self {
            label: label.to_string(),
            slot,
            offset,
            type_name: type_name.to_string(),
        }
    }

    /// Type identifier with compiler AST ids removed.
    ///
    /// solc embeds AST node ids in struct, enum, contract and user-defined value
    /// types (`t_struct(Pool)1234_storage`); those change between compilations
    /// without changing the layout. The length of a fixed-size array
    /// (`t_array(t_uint256)5_storage`) is part of the type and is kept.
    pub fn normalized_type(&self) -> String {
        let mut out = String::with_capacity(self.type_name.len());
        // one flag per open parenthesis: whether an AST id follows its close
        let mut groups: Vec<bool> = Vec::new();
        let mut token_start = 0;
        let mut strip_digits = false;
        for c in self.type_name.chars() {
            if strip_digits && c.is_ascii_digit() {
                continue;
            }
            strip_digits = false;
            match c {
                '(' => groups.push(carries_ast_id(&out[token_start..])),
                ')' => strip_digits = groups.pop().unwrap_or(false),
                _ => {}
            }
            out.push(c);
            if c == '(' || c == ',' {
                token_start = out.len();
            }
        }
        out
    }

    fn position(&self) -> (u64, u32) {
        (self.slot, self.offset)
    }
}

fn carries_ast_id(kind: &str) -> bool {
    matches!(kind, "t_struct" | "t_enum" | "t_contract" | "t_userDefinedValueType")
}

/// Why an upgrade's layout is rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// The variable no longer exists in the new layout
    Removed,
    /// The variable kept its position but changed type
    Retyped { from: String, to: String },
    /// The variable moved to a different slot or offset
    Moved { slot: u64, offset: u32 },
    /// A new variable was placed inside the existing layout
    Overlaps { label: String },
}

/// First incompatible slot found while comparing two layouts
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("storage slot {slot} (offset {offset}, `{label}`): {}", describe(.reason))]
pub struct LayoutConflict {
    pub label: String,
    pub slot: u64,
    pub offset: u32,
    pub reason: ConflictReason,
}

fn describe(reason: &ConflictReason) -> String {
    match reason {
        ConflictReason::Removed => "removed in new implementation".to_string(),
        ConflictReason::Retyped { from, to } => format!("type changed from {} to {}", from, to),
        ConflictReason::Moved { slot, offset } => {
            format!("moved to slot {} offset {}", slot, offset)
        }
        ConflictReason::Overlaps { label } => {
            format!("new variable `{}` is placed inside the existing layout", label)
        }
    }
}

/// Accepted differences between two compatible layouts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutDiff {
    /// `(old, new)` label pairs that kept slot, offset and type
    pub renamed: Vec<(String, String)>,
    /// Variables appended after the existing layout
    pub appended: Vec<String>,
}

impl StorageLayout {
    pub fn new(storage: Vec<StorageEntry>) -> Self {
        Self { storage }
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// keccak-256 over the canonical form of the layout
    pub fn fingerprint(&self) -> H256 {
        let mut canonical = String::new();
        for entry in &self.storage {
            canonical.push_str(&format!(
                "{}|{}|{}|{}\n",
                entry.label,
                entry.slot,
                entry.offset,
                entry.normalized_type()
            ));
        }
        H256::from(keccak256(canonical.as_bytes()))
    }

    /// Check that `next` can replace `self` behind a proxy.
    ///
    /// Every existing entry must keep its slot, offset and type at the same
    /// position; new entries may only be appended after the last existing one.
    pub fn check_upgrade(&self, next: &StorageLayout) -> Result<LayoutDiff, LayoutConflict> {
        let mut diff = LayoutDiff::default();

        for (index, old) in self.storage.iter().enumerate() {
            let conflict = |reason: ConflictReason| LayoutConflict {
                label: old.label.clone(),
                slot: old.slot,
                offset: old.offset,
                reason,
            };

            let new = next.storage.get(index).ok_or_else(|| conflict(ConflictReason::Removed))?;

            if new.position() != old.position() {
                return Err(conflict(ConflictReason::Moved {
                    slot: new.slot,
                    offset: new.offset,
                }));
            }

            let (from, to) = (old.normalized_type(), new.normalized_type());
            if from != to {
                return Err(conflict(ConflictReason::Retyped { from, to }));
            }

            if new.label != old.label {
                diff.renamed.push((old.label.clone(), new.label.clone()));
            }
        }

        let tail = self.storage.last().map(StorageEntry::position);
        for new in next.storage.iter().skip(self.storage.len()) {
            if let Some(last) = tail {
                if new.position() <= last {
                    let existing = self
                        .storage
                        .iter()
                        .rev()
                        .find(|old| old.position() <= new.position())
                        .unwrap_or(&self.storage[0]);
                    return Err(LayoutConflict {
                        label: existing.label.clone(),
                        slot: existing.slot,
                        offset: existing.offset,
                        reason: ConflictReason::Overlaps {
                            label: new.label.clone(),
                        },
                    });
                }
            }
            diff.appended.push(new.label.clone());
        }

        Ok(diff)
    }
}
