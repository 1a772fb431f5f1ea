//! Integration tests for the relay
//! These drive the HTTP router end to end against in-memory upstream sessions

mod harness;

mod relay_test;
mod stream_test;
