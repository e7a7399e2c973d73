pub mod mapping;
pub mod output;

use crate::registry::OperationRegistry;

pub use mapping::{MappingCreate, MappingExtract};
pub use output::{select_latest, Associate, GetSingle, GroupBy};

/// Register every built-in operation.
pub fn register_all(registry: &mut OperationRegistry) {
    // ── Output (3) ──────────────────────────────────────────
    registry.add(GetSingle::operation(), GetSingle);
    registry.add(Associate::operation(), Associate);
    registry.add(GroupBy::operation(), GroupBy);

    // ── Mapping (2) ─────────────────────────────────────────
    registry.add(MappingExtract::operation(), MappingExtract);
    registry.add(MappingCreate::operation(), MappingCreate);
}
