// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Stream framing used beneath stream mailboxes and acceptors.

pub mod codec;
pub mod composer;

pub use codec::JsonCodec;
pub use composer::{ComposeError, Composer};
