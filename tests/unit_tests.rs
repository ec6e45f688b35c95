//! Unit tests for configuration, errors, events, builders and runtime helpers.

mod unit;
