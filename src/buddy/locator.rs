use crate::types::MemberId;

/// Picks a member's buddies from the current view.
pub trait BuddyLocator: Send + Sync {
    fn locate_buddies(&self, local: MemberId, members: &[MemberId]) -> Vec<MemberId>;
}

/// The next `num_buddies` members after this one in view order, wrapping
/// around.
#[derive(Debug, Clone)]
pub struct NextMemberBuddyLocator {
    num_buddies: usize,
}

impl NextMemberBuddyLocator {
    pub fn new(num_buddies: usize) -> Self {
        Self { num_buddies }
    }
}

impl BuddyLocator for NextMemberBuddyLocator {
    fn locate_buddies(&self, local: MemberId, members: &[MemberId]) -> Vec<MemberId> {
        let Some(position) = members.iter().position(|m| *m == local) else {
            return members
                .iter()
                .copied()
                .filter(|m| *m != local)
                .take(self.num_buddies)
                .collect();
        };
        members
            .iter()
            .cycle()
            .skip(position + 1)
            .take(members.len() - 1)
            .copied()
            .take(self.num_buddies)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_members_wrap_around() {
        let locator = NextMemberBuddyLocator::new(2);
        assert_eq!(locator.locate_buddies(3, &[1, 2, 3, 4]), vec![4, 1]);
        assert_eq!(locator.locate_buddies(1, &[1, 2, 3, 4]), vec![2, 3]);
    }

    #[test]
    fn test_small_views() {
        let locator = NextMemberBuddyLocator::new(3);
        assert_eq!(locator.locate_buddies(1, &[1, 2]), vec![2]);
        assert!(locator.locate_buddies(1, &[1]).is_empty());
        assert_eq!(locator.locate_buddies(9, &[1, 2]), vec![1, 2]);
    }
}
