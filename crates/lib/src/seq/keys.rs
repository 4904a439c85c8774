//! Fractional string keys for sequence ordering.
//!
//! Keys are strings over the printable ASCII range `!`..=`~`, compared
//! lexicographically. [`between`] produces a key strictly inside an
//! interval, so an item can be placed between two neighbors without
//! renumbering anything else; appending a short [`random_suffix`] makes it
//! unlikely that two replicas concurrently inserting at the same position
//! pick an identical key.

use rand::Rng;

/// Lower list sentinel. Generated keys compare strictly above it.
pub(crate) const LOW: &str = "!";

/// Upper list sentinel. Generated keys compare strictly below it.
pub(crate) const HIGH: &str = "~";

const MIN: u8 = b'!';
const MAX: u8 = b'~';
/// Virtual digit below the alphabet, standing in for "string exhausted".
const FLOOR: u8 = MIN - 1;
/// Virtual digit above the alphabet.
const CEIL: u8 = MAX + 1;
/// Midpoint of the alphabet, used to extend past a committed prefix.
const MID: u8 = (MIN + MAX) / 2;

/// Returns a key strictly between `lo` and `hi`.
///
/// Requires `lo < hi`. `hi` must not be `lo` extended by a run of minimal
/// digits (`!`), the one interval this alphabet cannot split; the engine
/// never produces such an interval because every generated key ends in a
/// random suffix.
pub(crate) fn between(lo: &str, hi: &str) -> String {
    debug_assert!(lo < hi, "interval {lo:?}..{hi:?} is inverted or empty");
    let a = lo.as_bytes();
    let b = hi.as_bytes();
    let mut out = String::with_capacity(a.len().max(b.len()) + 1);
    let mut i = 0;
    loop {
        let x = a.get(i).copied().unwrap_or(FLOOR);
        let y = b.get(i).copied().unwrap_or(CEIL);
        if x == y {
            // common prefix
            out.push(x as char);
            i += 1;
            continue;
        }
        if y - x >= 2 {
            out.push(((x + y) / 2) as char);
            return out;
        }
        // adjacent digits leave no room at this position
        if x >= MIN {
            // commit the rest of lo and extend past it
            for byte in &a[i..] {
                out.push(*byte as char);
            }
            out.push(MID as char);
            return out;
        }
        // lo is exhausted while hi continues with the minimal digit:
        // descend along hi
        out.push(y as char);
        i += 1;
    }
}

/// `len` random digits from the key alphabet.
pub(crate) fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen_range(MIN..=MAX) as char).collect()
}
