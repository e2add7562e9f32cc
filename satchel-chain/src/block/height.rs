use serde::{Deserialize, Serialize};

/// The height of a block in its chain: the number of blocks between it and
/// the genesis block, which is at height zero.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct Height(pub u32);

impl Height {
    /// The height of the first block after genesis.
    pub const MIN: Height = Height(0);

    /// The largest height the wire format can represent.
    pub const MAX: Height = Height(u32::MAX);

    /// The height directly above this one, if it is representable.
    pub fn next(self) -> Option<Height> {
        self.0.checked_add(1).map(Height)
    }
}

impl std::fmt::Display for Height {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
