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

//! Configuration structures.
//!
//! This module contains the configuration object for the RPCSEC_GSS
//! credential machinery.  It has a YAML format, which can be parsed
//! using `serde_yaml`, thus allowing configurations to be easily
//! loaded from text files.
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Configuration for credential acquisition and refresh.
///
/// This controls the timing behavior of the upcall machinery: how
/// long a synchronous caller waits for a daemon to appear, how
/// quickly an absent daemon is re-probed, and how long an
/// expired-key credential refuses new upcalls.
///
/// # YAML Format
///
/// The YAML format has three fields, all of which are optional:
///
/// - `expired-cred-retry-delay`: Duration in seconds of the cooling-off
///   window after the daemon reports an expired key.  The default is 5.
///
/// - `upcall-timeout`: Time in seconds a synchronous caller will wait for
///   a daemon to attach to the upcall pipe.  The default is 15.
///
/// - `downed-daemon-retry`: Time in milliseconds to wait for a daemon
///   when a previous wait already timed out.  The default is 250.
///
/// ## Examples
///
/// The following is an example of the YAML format:
///
/// ```yaml
/// expired-cred-retry-delay: 5
/// upcall-timeout: 15
/// downed-daemon-retry: 250
/// ```
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
         Serialize)]
#[serde(rename_all = "kebab-case")]
#[serde(default)]
pub struct CredTimeouts {
    /// Cooling-off window in seconds for expired-key credentials.
    expired_cred_retry_delay: u64,
    /// Daemon wait timeout in seconds for synchronous callers.
    upcall_timeout: u64,
    /// Daemon re-probe timeout in milliseconds once known absent.
    downed_daemon_retry: u64
}

impl CredTimeouts {
    /// Create a `CredTimeouts` from its components.
    ///
    /// The arguments of this function correspond to similarly-named
    /// fields in the YAML format.
    #[inline]
    pub fn new(
        expired_cred_retry_delay: u64,
        upcall_timeout: u64,
        downed_daemon_retry: u64
    ) -> Self {
        CredTimeouts {
            expired_cred_retry_delay: expired_cred_retry_delay,
            upcall_timeout: upcall_timeout,
            downed_daemon_retry: downed_daemon_retry
        }
    }

    /// Get the cooling-off window for expired-key credentials.
    #[inline]
    pub fn expired_cred_retry_delay(&self) -> Duration {
        Duration::from_secs(self.expired_cred_retry_delay)
    }

    /// Get the daemon wait timeout for synchronous callers.
    #[inline]
    pub fn upcall_timeout(&self) -> Duration {
        Duration::from_secs(self.upcall_timeout)
    }

    /// Get the daemon re-probe timeout used once the daemon is known
    /// to be absent.
    #[inline]
    pub fn downed_daemon_retry(&self) -> Duration {
        Duration::from_millis(self.downed_daemon_retry)
    }

    /// Deconstruct this `CredTimeouts` into its components.
    #[inline]
    pub fn take(self) -> (Duration, Duration, Duration) {
        (
            Duration::from_secs(self.expired_cred_retry_delay),
            Duration::from_secs(self.upcall_timeout),
            Duration::from_millis(self.downed_daemon_retry)
        )
    }

    #[inline]
    fn default_expired_cred_retry_delay() -> u64 {
        5
    }

    #[inline]
    fn default_upcall_timeout() -> u64 {
        15
    }

    #[inline]
    fn default_downed_daemon_retry() -> u64 {
        250
    }
}

impl Default for CredTimeouts {
    #[inline]
    fn default() -> Self {
        CredTimeouts {
            expired_cred_retry_delay:
                Self::default_expired_cred_retry_delay(),
            upcall_timeout: Self::default_upcall_timeout(),
            downed_daemon_retry: Self::default_downed_daemon_retry()
        }
    }
}

#[test]
fn test_deserialize_timeouts_default() {
    let yaml = concat!("{}");
    let expected = CredTimeouts {
        expired_cred_retry_delay: 5,
        upcall_timeout: 15,
        downed_daemon_retry: 250
    };
    let actual = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(expected, actual)
}

#[test]
fn test_deserialize_timeouts() {
    let yaml = concat!(
        "expired-cred-retry-delay: 2\n",
        "upcall-timeout: 1\n",
        "downed-daemon-retry: 50\n"
    );
    let expected = CredTimeouts::new(2, 1, 50);
    let actual = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(expected, actual)
}

#[test]
fn test_timeouts_accessors() {
    let timeouts = CredTimeouts::new(2, 1, 50);

    assert_eq!(timeouts.expired_cred_retry_delay(), Duration::from_secs(2));
    assert_eq!(timeouts.upcall_timeout(), Duration::from_secs(1));
    assert_eq!(timeouts.downed_daemon_retry(), Duration::from_millis(50));
}
