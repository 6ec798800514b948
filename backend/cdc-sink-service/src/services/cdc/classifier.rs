use super::models::{DecodedPayload, MutationKind};

/// Classify a change event by which snapshots it carries.
///
/// | before  | after   | kind     |
/// |---------|---------|----------|
/// | absent  | present | Insert   |
/// | present | present | Update   |
/// | present | absent  | Delete   |
/// | absent  | absent  | Truncate |
pub fn classify(payload: &DecodedPayload) -> MutationKind {
    match (payload.before.is_some(), payload.after.is_some()) {
        (false, true) => MutationKind::Insert,
        (true, true) => MutationKind::Update,
        (true, false) => MutationKind::Delete,
        (false, false) => MutationKind::Truncate,
    }
}
