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

//! §4.3 "Color/tagging": a deterministic colour index per machine, computed
//! by hashing `MachineID` modulo a fixed palette of 12.

use yansi::Color;

/// A fixed palette of 12 terminal colours, cycling through the 8 standard
/// ANSI colours plus their bright variants to fill out the count.
const PALETTE: [Color; 12] = [
    Color::Red,
    Color::Green,
    Color::Yellow,
    Color::Blue,
    Color::Magenta,
    Color::Cyan,
    Color::RGB(255, 140, 0),
    Color::RGB(0, 200, 150),
    Color::RGB(200, 80, 200),
    Color::RGB(80, 160, 255),
    Color::RGB(255, 100, 100),
    Color::RGB(150, 200, 50),
];

/// Deterministically maps a machine ID to one of [`PALETTE`]'s 12 colours.
/// Two calls with the same `machine_id` always return the same colour,
/// regardless of process, since this hashes the string's bytes directly
/// rather than relying on `RandomState`'s per-process seed.
pub fn color_for_machine(machine_id: &str) -> Color {
    PALETTE[(fnv1a(machine_id) % PALETTE.len() as u64) as usize]
}

/// FNV-1a: a tiny, dependency-free, seed-free string hash. `std`'s
/// `DefaultHasher` is explicitly documented as unstable across releases and
/// randomly seeded per-process, neither of which this needs to survive —
/// only determinism across calls within one run, and ideally across runs
/// too, matters for a human operator correlating colours between sessions.
fn fnv1a(s: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for byte in s.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_machine_id_always_same_color() {
        let a = color_for_machine("m-0123");
        let b = color_for_machine("m-0123");
        assert_eq!(format!("{a:?}"), format!("{b:?}"));
    }

    #[test]
    fn distinct_ids_can_collide_but_hash_is_stable_across_calls() {
        let ids = ["m1", "m2", "m3", "m4", "m5", "m6"];
        let first_pass: Vec<String> = ids.iter().map(|id| format!("{:?}", color_for_machine(id))).collect();
        let second_pass: Vec<String> = ids.iter().map(|id| format!("{:?}", color_for_machine(id))).collect();
        assert_eq!(first_pass, second_pass);
    }
}
