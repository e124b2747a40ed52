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

//! Renders a [`LogEntry`] to stdout/stderr, coloured and prefixed per §4.3
//! "Color/tagging": `[MachineName (MachineID)/ServiceName]`.

use yansi::Paint;

use crate::color::color_for_machine;
use crate::model::{LogEntry, Stream};

/// Writes `entry` to stdout (if `Stream::Stdout`) or stderr (otherwise),
/// prefixed with a colour-tagged `[MachineName (MachineID)/ServiceName]`.
pub fn print_entry(entry: &LogEntry) {
    let prefix = format!(
        "[{} ({})/{}]",
        entry.machine_name, entry.machine_id, entry.service_name
    );
    let colored_prefix = Paint::new(prefix).fg(color_for_machine(&entry.machine_id));
    let message = String::from_utf8_lossy(&entry.message);
    match entry.stream {
        Stream::Stdout => println!("{colored_prefix} {message}"),
        Stream::Stderr => eprintln!("{colored_prefix} {message}"),
    }
}

/// Writes a per-machine stream failure to stderr as a warning, per §4.3
/// "Failure semantics": "per-machine errors are written to stderr as
/// warnings and do not abort other streams."
pub fn print_warning(machine_name: &str, machine_id: &str, err: &(impl std::fmt::Display + ?Sized)) {
    let prefix = format!("[{machine_name} ({machine_id})]");
    let colored_prefix = Paint::new(prefix).fg(color_for_machine(machine_id));
    eprintln!("{colored_prefix} warning: {err}");
}
