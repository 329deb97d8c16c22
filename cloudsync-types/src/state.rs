use serde::Deserialize;
use serde::Serialize;

/// Item lifecycle states (spec §3.3). `Virtual` is a terminal state for
/// local-only items with no remote counterpart.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ItemState {
    Ghost,
    Hydrating,
    Hydrated,
    DirtyLocal,
    Conflict,
    Error,
    Deleted,
    Virtual,
}

impl ItemState {
    /// True if `self -> target` is on the allow-list of spec §3.3.
    /// `Virtual` never transitions anywhere (its own terminal rule).
    pub fn allows(self, target: ItemState) -> bool {
        use ItemState::*;
        if self == Virtual {
            return false;
        }
        if self == target {
            // Re-entering the same state is handled by the caller as a
            // possible no-op/idempotent event, not by this allow-list.
            return false;
        }
        matches!(
            (self, target),
            (Ghost, Hydrating)
                | (Hydrating, Hydrated)
                | (Hydrating, Error)
                | (Hydrating, Ghost)
                | (Hydrated, DirtyLocal)
                | (Hydrated, Ghost)
                | (Hydrated, Hydrating)
                | (Hydrated, Deleted)
                | (DirtyLocal, Hydrated)
                | (DirtyLocal, Error)
                | (DirtyLocal, Conflict)
                | (Conflict, Hydrated)
                | (Conflict, Ghost)
                | (Error, Hydrating)
                | (Error, DirtyLocal)
                | (Error, Ghost)
        )
    }
}

/// A stamped failure snapshot, attached to an Entry's `last_error` and to
/// the relevant event (`hydration.error` / `upload.last_error`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LastError {
    pub message: String,
    pub occurred_at: i64,
    pub temporary: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ItemState::*;

    #[test]
    fn virtual_is_terminal() {
        for target in [Ghost, Hydrating, Hydrated, DirtyLocal, Conflict, Error, Deleted] {
            assert!(!Virtual.allows(target), "Virtual -> {target:?} must be rejected");
        }
    }

    #[test]
    fn allowed_transitions_match_spec_matrix() {
        assert!(Ghost.allows(Hydrating));
        assert!(Hydrating.allows(Hydrated));
        assert!(Hydrating.allows(Error));
        assert!(Hydrating.allows(Ghost));
        assert!(Hydrated.allows(DirtyLocal));
        assert!(Hydrated.allows(Ghost));
        assert!(Hydrated.allows(Hydrating));
        assert!(Hydrated.allows(Deleted));
        assert!(DirtyLocal.allows(Hydrated));
        assert!(DirtyLocal.allows(Error));
        assert!(DirtyLocal.allows(Conflict));
        assert!(Conflict.allows(Hydrated));
        assert!(Conflict.allows(Ghost));
        assert!(Error.allows(Hydrating));
        assert!(Error.allows(DirtyLocal));
        assert!(Error.allows(Ghost));
    }

    #[test]
    fn disallowed_transitions_are_rejected() {
        assert!(!Ghost.allows(Hydrated));
        assert!(!Deleted.allows(Ghost));
        assert!(!DirtyLocal.allows(Ghost));
        assert!(!Hydrated.allows(Conflict));
    }

    impl quickcheck::Arbitrary for ItemState {
        fn arbitrary(g: &mut quickcheck::Gen) -> Self {
            *g.choose(&[Ghost, Hydrating, Hydrated, DirtyLocal, Conflict, Error, Deleted, Virtual]).unwrap()
        }
    }

    #[quickcheck_macros::quickcheck]
    fn allows_is_irreflexive(state: ItemState) -> bool {
        !state.allows(state)
    }

    #[quickcheck_macros::quickcheck]
    fn virtual_never_allows_anything(target: ItemState) -> bool {
        !Virtual.allows(target)
    }

    #[quickcheck_macros::quickcheck]
    fn nothing_allows_virtual(state: ItemState) -> bool {
        !state.allows(Virtual)
    }

    #[quickcheck_macros::quickcheck]
    fn deleted_is_terminal(target: ItemState) -> bool {
        !Deleted.allows(target)
    }
}
