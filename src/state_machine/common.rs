// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Outcome of a single state step.
pub enum Transition<S, R> {
    /// Advance to state `S` and keep stepping.
    Next(S),
    /// Park the machine in `S` and hand control back to the caller with
    /// result `R`; a later re-entry continues from the parked state.
    Yield(S, R),
    /// Leave the machine with result `R`.
    Done(R),
}
