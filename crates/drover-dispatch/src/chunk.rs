//! Near-even splitting of a work total into chunk sizes.

/// Split `total` into `parts` chunk sizes that differ by at most one,
/// larger chunks first. Zero `parts` yields no chunks.
pub fn even_chunks(total: usize, parts: usize) -> Vec<usize> {
    if parts == 0 {
        return Vec::new();
    }
    let base = total / parts;
    let extra = total % parts;
    (0..parts)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect()
}
