// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use serde_derive::{Deserialize, Serialize};

mod cell;
mod system;
mod walker;

pub use crate::cell::{Cell, SinkStates};
pub use crate::system::System;
pub use crate::walker::Walker;
pub use topology::Coords;

///
/// A macro-state label carried by walkers. `DEFAULT_COLOR` marks a walker
/// that has not yet entered any sink.
///
pub type Color = i32;
pub const DEFAULT_COLOR: Color = -1;

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct WalkerId(pub u64);

impl fmt::Display for WalkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct CellId(pub u32);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

///
/// Mints monotonically increasing walker ids.
///
/// One source is owned by the iteration engine and threaded into the
/// resampler; its position rides in the checkpoint, so ids stay monotonic
/// across a crash and recovery.
///
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WalkerIdSource {
    next: u64,
}

impl WalkerIdSource {
    pub fn new() -> WalkerIdSource {
        WalkerIdSource { next: 0 }
    }

    pub fn starting_at(next: u64) -> WalkerIdSource {
        WalkerIdSource { next }
    }

    pub fn next_id(&mut self) -> WalkerId {
        let id = WalkerId(self.next);
        self.next += 1;
        id
    }
}
