//! Integration tests for shiplink-client
//!
//! Uses wiremock to simulate the REST backend and the SOAP partner
//! interface and verifies end-to-end behavior of retries, auth refresh,
//! the shared session token, and bulk downloads.

mod common;

mod test_auth_refresh;
mod test_bulk;
mod test_retry;
mod test_soap;
