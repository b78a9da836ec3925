use super::*;

macro_rules! common_set_tests {
    ($set_name:ident, $set_type:ident) => {
        mod $set_name {
            use super::*;

            #[test]
            fn merge_and_split() {
                let mut set = $set_type::new();
                assert!(set.insert(0..2));
                assert!(set.insert(2..4));
                assert!(!set.insert(1..3));
                assert_eq!(set.len(), 1);
                assert_eq!(&set.elts().collect::<Vec<_>>()[..], [0, 1, 2, 3]);
                assert!(!set.contains(4));
                assert!(set.remove(2..3));
                assert_eq!(set.len(), 2);
                assert!(!set.contains(2));
                assert_eq!(&set.elts().collect::<Vec<_>>()[..], [0, 1, 3]);
            }

            #[test]
            fn double_merge_wide() {
                let mut set = $set_type::new();
                assert!(set.insert(0..2));
                assert!(set.insert(4..6));
                assert_eq!(set.len(), 2);
                assert!(set.insert(1..5));
                assert_eq!(set.len(), 1);
                assert_eq!(&set.elts().collect::<Vec<_>>()[..], [0, 1, 2, 3, 4, 5]);
            }

            #[test]
            fn double_remove() {
                let mut set = $set_type::new();
                assert!(set.insert(0..2));
                assert!(set.insert(4..6));
                assert!(set.remove(1..5));
                assert_eq!(set.len(), 2);
                assert_eq!(&set.elts().collect::<Vec<_>>()[..], [0, 5]);
            }

            #[test]
            fn min_max_pop() {
                let mut set = $set_type::new();
                assert_eq!(set.min(), None);
                set.insert(10..12);
                set.insert(3..5);
                assert_eq!(set.min(), Some(3));
                assert_eq!(set.max(), Some(11));
                assert_eq!(set.pop_min(), Some(3..5));
                assert_eq!(set.pop_min(), Some(10..12));
                assert!(set.is_empty());
            }

            #[test]
            fn remove_absent() {
                let mut set = $set_type::new();
                set.insert(0..4);
                assert!(!set.remove(10..12));
                assert!(!set.remove(4..4));
                assert_eq!(set.len(), 1);
            }
        }
    };
}

common_set_tests!(range_set, RangeSet);
common_set_tests!(array_range_set, ArrayRangeSet);

#[test]
fn array_subtract() {
    let mut set = ArrayRangeSet::new();
    set.insert(0..10);
    let mut other = ArrayRangeSet::new();
    other.insert_one(3);
    other.insert(6..8);
    set.subtract(&other);
    assert_eq!(set.iter().collect::<Vec<_>>(), vec![0..3, 4..6, 8..10]);
}
