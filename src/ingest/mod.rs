// Copyright 2026 Daniel Pelikan
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

//! Byte stream ingestion: record reassembly and telemetry parsing.

mod parser;
mod reassembler;

pub use parser::{FieldError, FieldErrorKind, ParseOutcome, TelemetryParser, TelemetrySample};
pub use reassembler::{
    encode_frame, DelimiterMode, FrameReassembler, Reassembled, Record, DEFAULT_MAX_FRAME,
    LENGTH_PREFIX_SIZE,
};
