/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

#[cfg(test)]
pub mod engine;
#[cfg(test)]
pub mod pop3;
