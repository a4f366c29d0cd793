use crate::storage::page::PageId;

/// Shape of a table's tuples: a number of 4-byte integer columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    fields: usize,
}

impl Schema {
    pub fn new(fields: usize) -> Self {
        assert!(fields > 0, "a schema needs at least one field");
        Self { fields }
    }

    pub fn fields(&self) -> usize {
        self.fields
    }

    /// Bytes one tuple occupies on a page.
    pub fn tuple_bytes(&self) -> usize {
        self.fields * 4
    }
}

/// Where a stored tuple lives: its page and slot number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub pid: PageId,
    pub slot: usize,
}

/// A row of integer values, optionally carrying the location it was
/// stored at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    values: Vec<i32>,
    rid: Option<RecordId>,
}

impl Tuple {
    pub fn new(values: Vec<i32>) -> Self {
        Self { values, rid: None }
    }

    pub fn with_rid(values: Vec<i32>, rid: RecordId) -> Self {
        Self {
            values,
            rid: Some(rid),
        }
    }

    pub fn values(&self) -> &[i32] {
        &self.values
    }

    pub fn rid(&self) -> Option<RecordId> {
        self.rid
    }

    pub fn set_rid(&mut self, rid: RecordId) {
        self.rid = Some(rid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_bytes() {
        assert_eq!(Schema::new(1).tuple_bytes(), 4);
        assert_eq!(Schema::new(3).tuple_bytes(), 12);
    }

    #[test]
    fn test_tuple_rid() {
        let mut t = Tuple::new(vec![1, 2]);
        assert_eq!(t.rid(), None);
        let rid = RecordId {
            pid: PageId::new(0, 1),
            slot: 3,
        };
        t.set_rid(rid);
        assert_eq!(t.rid(), Some(rid));
    }
}
