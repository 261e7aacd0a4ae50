// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Delegation tokens: encrypted session cache and RFC 8693 exchange.

mod cache;
mod exchange;

pub use cache::{sha256_hex, CacheError, CacheMetrics, EncryptedTokenCache};
pub use exchange::{decode_claims_unverified, ExchangeOutcome, TokenExchangeEngine};
