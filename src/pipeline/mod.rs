//! Pipeline stages for turning a numbered image sequence into one PDF.
//!
//! Each submodule owns one concern, so the walk can be tested against a
//! scripted [`fetch::PageSource`] and the assembler against a hand-filled
//! [`store::PageStore`] without any network.
//!
//! ## Data Flow
//!
//! ```text
//! request ──▶ fetch ──▶ walk ──▶ store ──▶ assemble
//!  (URL)     (HTTP,     (page    (disk     (lopdf,
//!            retries)   loop)    cache)    DCTDecode)
//! ```
//!
//! 1. [`request`]: normalise the base URL and derive page URLs and file names
//! 2. [`identity`]: pick the user-agent for each request attempt
//! 3. [`fetch`]: one page, with backoff on 5xx/transport errors and
//!    `Retry-After` waits on 429; the only stage with network I/O
//! 4. [`walk`]: sequential page loop with the consecutive-failure
//!    circuit breaker and interrupt handling
//! 5. [`store`]: validated, atomically written page files; doubles as the
//!    resume cache
//! 6. [`assemble`]: batch header decode on the blocking pool, then ordered
//!    append into the output document

pub mod assemble;
pub mod fetch;
pub mod identity;
pub mod request;
pub mod store;
pub mod walk;
