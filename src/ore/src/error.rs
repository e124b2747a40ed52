// Copyright The Uncloud Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error formatting conventions.

use std::fmt::Write;

/// Extends `anyhow::Error` (and anything else that exposes a source chain)
/// with a display mode that includes every `Caused by:` layer, for use at
/// the top level of a binary's `main` where the default `{}` rendering
/// would otherwise print only the outermost context.
pub trait ErrorExt {
    /// Renders the error together with its full chain of causes, one per
    /// line, each indented and prefixed with "Caused by:".
    fn display_with_causes(&self) -> String;
}

impl ErrorExt for anyhow::Error {
    fn display_with_causes(&self) -> String {
        let mut out = self.to_string();
        for cause in self.chain().skip(1) {
            write!(out, "\nCaused by:\n    {cause}").expect("writing to a String cannot fail");
        }
        out
    }
}

impl ErrorExt for tonic::Status {
    fn display_with_causes(&self) -> String {
        format!("{:?}: {}", self.code(), self.message())
    }
}
