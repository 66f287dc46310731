// Integration tests for the sync engine
// Scenarios run against the local transport and an instrumented in-memory one

mod support;

mod concurrency_tests;
mod full_sync_tests;
mod retry_tests;
mod watch_tests;
