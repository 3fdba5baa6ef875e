// Copyright (c) The minnow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod cleanup_tests;
mod elimination_tests;
mod fixtures;
mod graph_tests;
mod reshape_tests;
