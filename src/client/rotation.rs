//! Rotation of peers eligible for new operations.
//!
//! The rotation is a dense array of peer indices served round-robin. Each
//! peer caches its slot so that insertion and removal are O(1).

use crate::random::Random;

/// A record that can sit in an [`ActiveRotation`].
pub trait RotationMember {
    fn active_index(&self) -> Option<usize>;
    fn set_active_index(&mut self, index: Option<usize>);
}

#[derive(Debug, Default)]
pub struct ActiveRotation {
    slots: Vec<usize>,
    next: usize,
}

impl ActiveRotation {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot that will be served next.
    #[cfg(test)]
    pub fn cursor(&self) -> usize {
        self.next
    }

    /// Member indices in serving order, starting at slot 0.
    #[cfg(test)]
    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    fn swap<P: RotationMember>(&mut self, members: &mut [P], a: usize, b: usize) {
        let (ma, mb) = (self.slots[a], self.slots[b]);
        members[ma].set_active_index(Some(b));
        members[mb].set_active_index(Some(a));
        self.slots.swap(a, b);
    }

    /// Append `member`, then move it to a random slot so it is served either
    /// in this pass or the next one.
    pub fn add<P: RotationMember>(&mut self, members: &mut [P], member: usize, random: &mut Random) {
        assert!(
            members[member].active_index().is_none(),
            "member {member} is already in the rotation"
        );

        self.slots.push(member);
        let last = self.slots.len() - 1;
        members[member].set_active_index(Some(last));

        let slot = random.urand(self.slots.len());
        self.swap(members, slot, last);
        debug_assert_eq!(members[member].active_index(), Some(slot));
    }

    /// Take `member` out by swapping it with the last slot.
    ///
    /// When the moved member lands behind the cursor it is exchanged with the
    /// most recently served slot, so nobody is skipped or served twice in the
    /// current pass.
    pub fn remove<P: RotationMember>(&mut self, members: &mut [P], member: usize) {
        let Some(slot) = members[member].active_index() else {
            panic!("member {member} is not in the rotation");
        };

        let last = self.slots.len() - 1;
        self.swap(members, slot, last);
        self.slots.pop();
        members[member].set_active_index(None);

        if self.next == self.slots.len() {
            self.next = 0;
        } else if slot < self.next {
            self.next -= 1;
            self.swap(members, slot, self.next);
        }
    }

    /// Next member in round-robin order.
    pub fn pick(&mut self) -> Option<usize> {
        let member = *self.slots.get(self.next)?;
        self.next += 1;
        if self.next == self.slots.len() {
            self.next = 0;
        }
        Some(member)
    }
}
