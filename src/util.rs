//! Small shared helpers.

/// Integer percentage of `part` in `whole`; zero when `whole` is zero.
pub fn percent(part: u64, whole: u64) -> u32 {
    if whole == 0 {
        return 0;
    }
    ((part * 100) / whole) as u32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(1, 0), 0);
        assert_eq!(percent(0, 10), 0);
        assert_eq!(percent(3, 4), 75);
        assert_eq!(percent(10, 10), 100);
        assert_eq!(percent(1, 3), 33);
    }
}
