// Kept out of line so the comparison loop is not specialized on its inputs.
#[inline(never)]
fn xor_fold(a: &[u8], b: &[u8]) -> u8 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).fold(0, |acc, (x, y)| acc | (x ^ y))
}

/// Compares byte strings in time independent of their contents
pub(crate) fn eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && xor_fold(a, b) == 0
}

#[cfg(test)]
mod tests {
    #[test]
    fn compare() {
        assert!(super::eq(b"token", b"token"));
        assert!(!super::eq(b"token", b"tokem"));
        assert!(!super::eq(b"token", b"tok"));
    }
}
