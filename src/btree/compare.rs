//! compare orders index key records.
//!
//! Index entries are records whose columns are the indexed columns in
//! order, followed by the owning row's rowid.  Ordering is column by
//! column: storage classes order NULL < numeric < text < blob, numerics
//! compare by value across Int and Real, text and blob compare bytewise.
//! A descending column flips its comparison.  The trailing rowid column
//! (always ascending) makes stored entries unique.
//!
//! A probe record may carry fewer columns than stored entries; columns past
//! the probe compare equal, so a key-only probe matches every rowid suffix.

use std::cmp::Ordering;

use crate::record;
use crate::sql_value::ValueRef;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyOrdering {
    /// One flag per indexed column; `true` means descending.  Columns past
    /// the end of this list (the rowid suffix) compare ascending.
    pub descending: Vec<bool>,
}

impl KeyOrdering {
    pub fn ascending(columns: usize) -> KeyOrdering {
        KeyOrdering {
            descending: vec![false; columns],
        }
    }
}

fn storage_class_rank(v: &ValueRef) -> u8 {
    match v {
        ValueRef::Null => 0,
        ValueRef::Int(_) | ValueRef::Real(_) => 1,
        ValueRef::Text(_) => 2,
        ValueRef::Blob(_) => 3,
    }
}

/// Compare two column values with SQLite's cross-class ordering.
pub fn compare_values(a: &ValueRef, b: &ValueRef) -> Ordering {
    let (ra, rb) = (storage_class_rank(a), storage_class_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (ValueRef::Null, ValueRef::Null) => Ordering::Equal,
        (ValueRef::Int(x), ValueRef::Int(y)) => x.cmp(y),
        (ValueRef::Real(x), ValueRef::Real(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (ValueRef::Int(x), ValueRef::Real(y)) => (*x as f64)
            .partial_cmp(y)
            .unwrap_or(Ordering::Equal),
        (ValueRef::Real(x), ValueRef::Int(y)) => x
            .partial_cmp(&(*y as f64))
            .unwrap_or(Ordering::Equal),
        (ValueRef::Text(x), ValueRef::Text(y)) => x.cmp(y),
        (ValueRef::Blob(x), ValueRef::Blob(y)) => x.cmp(y),
        _ => unreachable!("ranks matched"),
    }
}

/// Compare two encoded key records under `ordering`.
pub fn compare_key_records(
    a: &[u8],
    b: &[u8],
    ordering: &KeyOrdering,
) -> Result<Ordering, record::Error> {
    let mut va = Vec::new();
    let mut vb = Vec::new();
    record::decode_record(a, &mut va)?;
    record::decode_record(b, &mut vb)?;
    Ok(compare_decoded_keys(&va, &vb, ordering))
}

/// Compare already-decoded key columns under `ordering`.  Comparison stops
/// at the shorter record; a prefix probe ties with anything it prefixes.
pub fn compare_decoded_keys(a: &[ValueRef], b: &[ValueRef], ordering: &KeyOrdering) -> Ordering {
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let mut ord = compare_values(x, y);
        if ordering.descending.get(i).copied().unwrap_or(false) {
            ord = ord.reverse();
        }
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::encode_record;
    use crate::sql_value::SqlValue;

    fn rec(values: &[SqlValue]) -> Vec<u8> {
        encode_record(values)
    }

    #[test]
    fn test_storage_class_ordering() {
        use SqlValue::*;
        let ord = KeyOrdering::ascending(1);
        // NULL < numbers < text < blob.
        let ladder = [
            rec(&[Null]),
            rec(&[Int(-5)]),
            rec(&[Real(0.5)]),
            rec(&[Int(2)]),
            rec(&[Text("a".into())]),
            rec(&[Text("b".into())]),
            rec(&[Blob(vec![0])]),
        ];
        for w in ladder.windows(2) {
            assert_eq!(
                compare_key_records(&w[0], &w[1], &ord).unwrap(),
                Ordering::Less
            );
        }
    }

    #[test]
    fn test_descending_flips() {
        use SqlValue::*;
        let ord = KeyOrdering {
            descending: vec![true],
        };
        assert_eq!(
            compare_key_records(&rec(&[Int(1)]), &rec(&[Int(2)]), &ord).unwrap(),
            Ordering::Greater
        );
    }

    #[test]
    fn test_rowid_suffix_breaks_ties() {
        use SqlValue::*;
        let ord = KeyOrdering::ascending(1);
        let a = rec(&[Int(42), Int(1)]); // (key, rowid)
        let b = rec(&[Int(42), Int(2)]);
        assert_eq!(compare_key_records(&a, &b, &ord).unwrap(), Ordering::Less);
    }

    #[test]
    fn test_prefix_probe_ties() {
        use SqlValue::*;
        let ord = KeyOrdering::ascending(1);
        let probe = rec(&[Int(42)]);
        let stored = rec(&[Int(42), Int(9)]);
        assert_eq!(
            compare_key_records(&probe, &stored, &ord).unwrap(),
            Ordering::Equal
        );
    }

    #[test]
    fn test_descending_does_not_apply_to_rowid() {
        use SqlValue::*;
        let ord = KeyOrdering {
            descending: vec![true],
        };
        let a = rec(&[Int(42), Int(1)]);
        let b = rec(&[Int(42), Int(2)]);
        // Key column ties; rowid compares ascending despite the DESC key.
        assert_eq!(compare_key_records(&a, &b, &ord).unwrap(), Ordering::Less);
    }
}
