/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod external;
pub mod login;
pub mod plain;

use crate::{external::External, login::Login, plain::Plain};

/// Credentials handed to a mechanism when the client state is built.
///
/// `authid` is the authentication identity and is required by most
/// mechanisms; `authzid` is the authorization identity (who to log in as
/// when `authid` is a master user); `password` is required unless the
/// mechanism is flagged password-less.
#[derive(Debug, Default, Clone)]
pub struct Credentials {
    pub authid: Option<String>,
    pub authzid: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The server's final response reported a failed authentication.
    #[error("{0}")]
    AuthFailed(String),
    /// The server sent invalid SASL protocol input.
    #[error("{0}")]
    Protocol(String),
    /// Client-side error, typically missing credentials.
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Login,
    External,
}

impl Mechanism {
    /// Case-insensitive mechanism lookup.
    pub fn find(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("PLAIN") {
            Some(Mechanism::Plain)
        } else if name.eq_ignore_ascii_case("LOGIN") {
            Some(Mechanism::Login)
        } else if name.eq_ignore_ascii_case("EXTERNAL") {
            Some(Mechanism::External)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mechanism::Plain => "PLAIN",
            Mechanism::Login => "LOGIN",
            Mechanism::External => "EXTERNAL",
        }
    }

    /// Whether the mechanism sends a password. EXTERNAL authenticates out
    /// of band and never does.
    pub fn uses_password(&self) -> bool {
        !matches!(self, Mechanism::External)
    }

    pub fn client(&self, credentials: Credentials) -> Client {
        match self {
            Mechanism::Plain => Client::Plain(Plain::new(credentials)),
            Mechanism::Login => Client::Login(Login::new(credentials)),
            Mechanism::External => Client::External(External::new(credentials)),
        }
    }
}

impl std::fmt::Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-mechanism client state.
///
/// `input` consumes the latest server token, `output` produces the next
/// client token. A mechanism may complete in one or several exchanges;
/// further server input after completion is a protocol error.
pub enum Client {
    Plain(Plain),
    Login(Login),
    External(External),
}

impl Client {
    pub fn mechanism(&self) -> Mechanism {
        match self {
            Client::Plain(_) => Mechanism::Plain,
            Client::Login(_) => Mechanism::Login,
            Client::External(_) => Mechanism::External,
        }
    }

    pub fn input(&mut self, data: &[u8]) -> Result<(), Error> {
        match self {
            Client::Plain(client) => client.input(data),
            Client::Login(client) => client.input(data),
            Client::External(client) => client.input(data),
        }
    }

    pub fn output(&mut self) -> Result<Vec<u8>, Error> {
        match self {
            Client::Plain(client) => client.output(),
            Client::Login(client) => client.output(),
            Client::External(client) => client.output(),
        }
    }
}
