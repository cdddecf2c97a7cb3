/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::{Credentials, Error};

/// PLAIN completes in a single exchange: the client token is
/// `authzid NUL authid NUL password`. When no authzid is set the token
/// starts directly with `authid NUL` (no leading NUL is written).
pub struct Plain {
    credentials: Credentials,
    output_sent: bool,
}

impl Plain {
    pub(crate) fn new(credentials: Credentials) -> Self {
        Plain {
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
        let authid = self
            .credentials
            .authid
            .as_deref()
            .ok_or_else(|| Error::Internal("authid not set".to_string()))?;
        let password = self
            .credentials
            .password
            .as_deref()
            .ok_or_else(|| Error::Internal("password not set".to_string()))?;

        let mut token = Vec::with_capacity(64);
        if let Some(authzid) = self.credentials.authzid.as_deref() {
            token.extend_from_slice(authzid.as_bytes());
        }
        token.push(0);
        token.extend_from_slice(authid.as_bytes());
        token.push(0);
        token.extend_from_slice(password.as_bytes());

        self.output_sent = true;
        Ok(token)
    }
}
