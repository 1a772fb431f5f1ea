//! Unit tests for the session actor, registry and event bus

mod helpers;

mod session_test;
