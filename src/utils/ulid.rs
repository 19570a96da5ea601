//! Monotonic ULID generation for scan ids.
//!
//! Every request is bound to a scan id at proxy entry; the same id flows
//! through logs, audit events, response headers and downstream errors.
//! ULIDs sort lexicographically by creation time, which gives the audit
//! trail natural ordering without a separate sequence column.

use once_cell::sync::Lazy;
use std::sync::Mutex;
use ulid::Generator;

static GENERATOR: Lazy<Mutex<Generator>> = Lazy::new(|| Mutex::new(Generator::new()));

/// Generate a monotonic, process-unique ULID string (26 chars, Crockford base32).
///
/// Monotonic within the process: two ids generated in the same millisecond
/// still sort in generation order. On the (pathological) random-overflow
/// error the generator is reset and a fresh ULID is produced.
pub fn generate_ulid() -> String {
    let mut gen = match GENERATOR.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    match gen.generate() {
        Ok(id) => id.to_string(),
        Err(_) => {
            // Monotonic overflow within a single millisecond — start a fresh
            // generator rather than failing the request.
            *gen = Generator::new();
            ulid::Ulid::new().to_string()
        }
    }
}
