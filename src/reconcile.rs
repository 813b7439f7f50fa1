//! Create/update/delete planning between desired and actual objects.

use crate::join::hash_join;

#[derive(Debug, PartialEq, Eq)]
pub struct Plan<T> {
    pub create: Vec<T>,
    /// `(desired, actual)` pairs whose content differs.
    pub update: Vec<(T, T)>,
    pub delete: Vec<T>,
}

impl<T> Plan<T> {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Join `desired` and `actual` on `name`.  Matched objects are only updated
/// when `differs` says so.
pub fn plan<T>(
    desired: Vec<T>,
    actual: Vec<T>,
    name: impl Fn(&T) -> String,
    differs: impl Fn(&T, &T) -> bool,
) -> Plan<T> {
    let joined = hash_join(desired, actual, &name, &name);
    Plan {
        create: joined.left_only,
        update: joined
            .pairs
            .into_iter()
            .filter(|(want, have)| differs(want, have))
            .collect(),
        delete: joined.right_only,
    }
}
