// Copyright 2025 Sandpool Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


//! # Sandpool CLI
//!
//! Command-line interface for the sandpool dispatcher.
//!
//! - `sandpool serve`: run the HTTP entry point in front of a pool of worker
//!   processes started on demand
//! - `sandpool status`: print a running dispatcher's instance listing
//!
//! Argument parsing uses `argh`; everything else lives in
//! `sandpool-dispatcher`.

pub mod status;
