// Copyright (c) Mesh Contributors
// SPDX-License-Identifier: Apache-2.0

mod crypto;
mod endpoint;
mod identity;
mod parameters;

pub use crypto::*;
pub use endpoint::*;
pub use identity::*;
pub use parameters::*;
