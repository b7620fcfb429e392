// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

#![allow(clippy::redundant_field_names)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]
#![allow(clippy::upper_case_acronyms)]

//! Client-side RPCSEC_GSS authentication for an ONC RPC runtime.
//!
//! This package provides the credential and security-context
//! machinery that stamps outbound RPC calls with a GSS verifier and
//! optionally protects call bodies with integrity checksums or
//! encryption.  Contexts are obtained from a user-space helper
//! daemon over named upcall pipes; the daemon performs the actual
//! mechanism exchange (Kerberos 5, typically) and hands back an
//! opaque context blob.
//!
//! # Structure
//!
//! - The [mech] module defines the provider interface: an opaque
//!   mechanism that imports context blobs and performs MIC, wrap,
//!   and unwrap operations.  A Kerberos 5 provider backed by
//!   `libgssapi` is available behind the `krb5` feature.
//!
//! - The [pipe] module provides the upcall channels a daemon
//!   attaches to, including the process-wide protocol version latch.
//!
//! - The [upcall] module coordinates requests to the daemon,
//!   collapsing concurrent requests per user onto one message and
//!   fanning completion out to both synchronous and asynchronous
//!   waiters.
//!
//! - The [cred] module caches per-user credentials and publishes
//!   their shared contexts for lock-free readers.
//!
//! - The [auth] module implements the RPC runtime's auth-flavor
//!   contract on top of all of the above: marshal, validate, wrap,
//!   unwrap, and refresh.
//!
//! The [rpc] module supplies the thin slice of the host runtime the
//! rest binds to (tasks, wait queues, the owning client), and [xdr]
//! the segmented marshalling buffers.
pub mod auth;
pub mod config;
pub mod cred;
pub mod error;
pub mod mech;
pub mod pipe;
pub mod rpc;
pub mod upcall;
pub mod xdr;

#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
use log::LevelFilter;

#[cfg(test)]
static INIT: Once = Once::new();

#[cfg(test)]
fn init() {
    INIT.call_once(|| {
        env_logger::builder()
            .is_test(true)
            .filter_level(LevelFilter::Trace)
            .init()
    })
}
