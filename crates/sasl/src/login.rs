/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::{Credentials, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    User,
    Pass,
}

/// LOGIN is a three-step exchange: an empty initial token, then the
/// username in reply to the server's first challenge, then the password in
/// reply to the second. Server input simply advances the state; the
/// challenge prompts themselves are ignored.
pub struct Login {
    credentials: Credentials,
    state: State,
}

impl Login {
    pub(crate) fn new(credentials: Credentials) -> Self {
        Login {
            credentials,
            state: State::Init,
        }
    }

    pub(crate) fn input(&mut self, _data: &[u8]) -> Result<(), Error> {
        self.state = match self.state {
            State::Init => State::User,
            State::User => State::Pass,
            State::Pass => {
                return Err(Error::Protocol(
                    "Server didn't finish authentication".to_string(),
                ))
            }
        };
        Ok(())
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

        Ok(match self.state {
            State::Init => Vec::new(),
            State::User => authid.as_bytes().to_vec(),
            State::Pass => password.as_bytes().to_vec(),
        })
    }
}
