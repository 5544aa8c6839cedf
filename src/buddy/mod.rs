//! Buddy replication.
//!
//! Instead of replicating to every peer, each member replicates to a small
//! buddy group. Buddies keep the owner's data under
//! `/_BUDDY_BACKUP_/<group>/...`, where the group name is derived from the
//! owner's member id. When a member is asked for a path it doesn't hold,
//! data gravitation pulls the subtree over from the owner or a backup.

mod locator;

pub use locator::{BuddyLocator, NextMemberBuddyLocator};

use crate::command::Command;
use crate::config::BuddyReplicationConfig;
use crate::fqn::Fqn;
use crate::types::MemberId;
use parking_lot::RwLock;
use std::fmt;
use tracing::info;

/// Name of the subtree holding backup copies of other members' data.
pub const BUDDY_BACKUP_ROOT: &str = "_BUDDY_BACKUP_";

/// Members that joined and left this member's buddy group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuddyGroupChange {
    pub added: Vec<MemberId>,
    pub removed: Vec<MemberId>,
}

impl BuddyGroupChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Tracks this member's buddies and maps between primary and backup paths.
pub struct BuddyManager {
    local: MemberId,
    locator: Box<dyn BuddyLocator>,
    buddies: RwLock<Vec<MemberId>>,
}

impl fmt::Debug for BuddyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyManager")
            .field("local", &self.local)
            .field("buddies", &*self.buddies.read())
            .finish()
    }
}

impl BuddyManager {
    pub fn new(local: MemberId, config: &BuddyReplicationConfig) -> Self {
        Self::with_locator(
            local,
            Box::new(NextMemberBuddyLocator::new(config.num_buddies)),
        )
    }

    pub fn with_locator(local: MemberId, locator: Box<dyn BuddyLocator>) -> Self {
        Self {
            local,
            locator,
            buddies: RwLock::new(Vec::new()),
        }
    }

    pub fn local_member(&self) -> MemberId {
        self.local
    }

    pub fn buddies(&self) -> Vec<MemberId> {
        self.buddies.read().clone()
    }

    /// Group name under the backup root for `member`'s data.
    pub fn group_name_for(member: MemberId) -> String {
        format!("member_{}", member)
    }

    pub fn backup_root() -> Fqn {
        Fqn::from_elements([BUDDY_BACKUP_ROOT])
    }

    /// Root of the backup subtree holding `owner`'s data.
    pub fn backup_group_fqn(owner: MemberId) -> Fqn {
        Self::backup_root().child(Self::group_name_for(owner))
    }

    /// Where `owner`'s `fqn` lives on its buddies.
    pub fn backup_fqn_for(owner: MemberId, fqn: &Fqn) -> Fqn {
        Self::backup_group_fqn(owner).join(fqn)
    }

    /// Where this member's `fqn` lives on its buddies.
    pub fn backup_fqn(&self, fqn: &Fqn) -> Fqn {
        Self::backup_fqn_for(self.local, fqn)
    }

    pub fn is_backup_fqn(fqn: &Fqn) -> bool {
        fqn.get(0) == Some(BUDDY_BACKUP_ROOT)
    }

    /// The primary path a backup path stands for. Primary paths map to
    /// themselves.
    pub fn primary_fqn(fqn: &Fqn) -> Fqn {
        if Self::is_backup_fqn(fqn) && fqn.depth() >= 2 {
            fqn.sub_fqn(2, fqn.depth())
        } else {
            fqn.clone()
        }
    }

    /// `command` rewritten to address this member's backup subtree.
    pub fn backup_command(&self, command: &Command) -> Command {
        command.map_fqns(&|fqn| self.backup_fqn(fqn))
    }

    /// Recompute the buddy group for a new view.
    pub fn view_changed(&self, members: &[MemberId]) -> BuddyGroupChange {
        let new_buddies = self.locator.locate_buddies(self.local, members);
        let mut buddies = self.buddies.write();
        let change = BuddyGroupChange {
            added: new_buddies
                .iter()
                .filter(|m| !buddies.contains(m))
                .copied()
                .collect(),
            removed: buddies
                .iter()
                .filter(|m| !new_buddies.contains(m))
                .copied()
                .collect(),
        };
        if !change.is_empty() {
            info!(
                member = self.local,
                buddies = ?new_buddies,
                added = ?change.added,
                removed = ?change.removed,
                "Buddy group changed"
            );
        }
        *buddies = new_buddies;
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_fqn_mapping() {
        let manager = BuddyManager::new(3, &BuddyReplicationConfig::enabled(1));
        let primary = Fqn::parse("/a/b");
        let backup = manager.backup_fqn(&primary);
        assert_eq!(backup, Fqn::parse("/_BUDDY_BACKUP_/member_3/a/b"));
        assert!(BuddyManager::is_backup_fqn(&backup));
        assert!(!BuddyManager::is_backup_fqn(&primary));
        assert_eq!(BuddyManager::primary_fqn(&backup), primary);
        assert_eq!(BuddyManager::primary_fqn(&primary), primary);
    }

    #[test]
    fn test_view_change_reports_added_and_removed() {
        let manager = BuddyManager::new(1, &BuddyReplicationConfig::enabled(1));
        let change = manager.view_changed(&[1, 2, 3]);
        assert_eq!(change.added, vec![2]);
        assert!(change.removed.is_empty());
        assert_eq!(manager.buddies(), vec![2]);

        let change = manager.view_changed(&[1, 3]);
        assert_eq!(change.added, vec![3]);
        assert_eq!(change.removed, vec![2]);

        assert!(manager.view_changed(&[1, 3]).is_empty());
    }

    #[test]
    fn test_backup_command_rewrites_paths() {
        let manager = BuddyManager::new(2, &BuddyReplicationConfig::enabled(1));
        let command = manager.backup_command(&Command::put("/x", "k", "v"));
        assert_eq!(
            command.fqn(),
            Some(&Fqn::parse("/_BUDDY_BACKUP_/member_2/x"))
        );
    }
}
