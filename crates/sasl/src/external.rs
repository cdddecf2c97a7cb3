/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::{Credentials, Error};

/// EXTERNAL authenticates out of band (TLS client certificate or similar);
/// the single client token names the identity to authorize: the authzid if
/// set, else the authid, else empty.
pub struct External {
    credentials: Credentials,
    output_sent: bool,
}

impl External {
    pub(crate) fn new(credentials: Credentials) -> Self {
        External {
            credentials,
            output_sent: false,
        }
    }

    pub(crate) fn input(&mut self, data: &[u8]) -> Result<(), Error> {
        if !self.output_sent {
            if !data.is_empty() {
                Err(Error::Protocol(
                    "Server sent non-empty initial response".to_string(),
                ))
            } else {
                Ok(())
            }
        } else {
            Err(Error::Protocol(
                "Server didn't finish authentication".to_string(),
            ))
        }
    }

    pub(crate) fn output(&mut self) -> Result<Vec<u8>, Error> {
        let username = self
            .credentials
            .authzid
            .as_deref()
            .or(self.credentials.authid.as_deref())
            .unwrap_or("");

        self.output_sent = true;
        Ok(username.as_bytes().to_vec())
    }
}
