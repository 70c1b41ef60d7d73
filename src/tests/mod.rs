//! Scenario tests for the recovery core
//!
//! Module-level unit tests live next to their code; these exercise the
//! manager, breakers and classifier together.
