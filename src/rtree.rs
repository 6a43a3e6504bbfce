//! Regular trees describing the recursive positions of inductive types.
//!
//! A tree node carries a [`Recarg`] label and one subtree per constructor
//! argument. Back-references (`Param`) and recursive binders (`Rec`) make
//! the trees possibly cyclic, so nested inductives can be described without
//! building an infinite structure. Equality, inclusion and intersection are
//! bisimulations working up to unfolding of the recursive binders.

use crate::ast::IndRef;

/// Tag attached to a node of a recursive-argument tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recarg {
    /// Non-recursive position.
    Norec,
    /// Direct occurrence of one of the inductives of the current block.
    Mrec(IndRef),
    /// Occurrence nested inside another inductive type.
    Imbr(IndRef),
}

/// Partial intersection of labels. `Mrec` wins over `Imbr` on the same
/// inductive; mixing distinct inductives, or a recursive label with
/// `Norec`, is incompatible.
pub fn inter_recarg(r1: &Recarg, r2: &Recarg) -> Option<Recarg> {
    use Recarg::*;
    match (r1, r2) {
        (Norec, Norec) => Some(Norec),
        (Mrec(i1), Mrec(i2)) | (Imbr(i1), Imbr(i2)) | (Mrec(i1), Imbr(i2)) if i1 == i2 => {
            Some(r1.clone())
        }
        (Imbr(i1), Mrec(i2)) if i1 == i2 => Some(r2.clone()),
        _ => None,
    }
}

/// A possibly-cyclic regular tree.
///
/// `Param(depth, j)` points into the `depth`-th enclosing `Rec` binder and
/// selects its `j`-th component; `Rec(j, defs)` binds `defs.len()` mutually
/// recursive trees and denotes the `j`-th of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RTree {
    Param(usize, usize),
    Node(Recarg, Vec<RTree>),
    Rec(usize, Vec<RTree>),
}

/// The recursive-argument tree of an inductive, as stored in the
/// environment and threaded through subterm specs.
pub type WfPaths = RTree;

impl RTree {
    pub fn node(label: Recarg, sons: Vec<RTree>) -> RTree {
        RTree::Node(label, sons)
    }

    /// The tree of a position where no recursion can happen.
    pub fn norec() -> RTree {
        RTree::Node(Recarg::Norec, Vec::new())
    }

    pub fn is_norec(&self) -> bool {
        self.equal(&RTree::norec())
    }

    /// `n` fresh back-references into an enclosing recursive binder.
    pub fn rec_calls(n: usize) -> Vec<RTree> {
        (0..n).map(|j| RTree::Param(0, j)).collect()
    }

    /// Tie the knot for a family of mutually recursive trees.
    pub fn mk_rec(defs: &[RTree]) -> Vec<RTree> {
        (0..defs.len()).map(|j| RTree::Rec(j, defs.to_vec())).collect()
    }

    fn lift_rec(&self, depth: usize, n: usize) -> RTree {
        match self {
            RTree::Param(i, j) => {
                if *i < depth {
                    RTree::Param(*i, *j)
                } else {
                    RTree::Param(i + n, *j)
                }
            }
            RTree::Node(l, sons) => RTree::Node(
                l.clone(),
                sons.iter().map(|s| s.lift_rec(depth, n)).collect(),
            ),
            RTree::Rec(j, defs) => RTree::Rec(
                *j,
                defs.iter().map(|d| d.lift_rec(depth + 1, n)).collect(),
            ),
        }
    }

    /// Shift back-references past `n` new recursive binders.
    pub fn lift(&self, n: usize) -> RTree {
        if n == 0 {
            self.clone()
        } else {
            self.lift_rec(0, n)
        }
    }

    fn subst_rec(&self, depth: usize, sub: &[RTree]) -> RTree {
        match self {
            RTree::Param(i, j) => {
                if *i < depth {
                    RTree::Param(*i, *j)
                } else if *i == depth {
                    RTree::Rec(*j, sub.to_vec()).lift(depth)
                } else {
                    RTree::Param(i - 1, *j)
                }
            }
            RTree::Node(l, sons) => RTree::Node(
                l.clone(),
                sons.iter().map(|s| s.subst_rec(depth, sub)).collect(),
            ),
            RTree::Rec(j, defs) => RTree::Rec(
                *j,
                defs.iter().map(|d| d.subst_rec(depth + 1, sub)).collect(),
            ),
        }
    }

    /// Unfold recursive binders at the root until a `Node` shows up.
    pub fn expand(&self) -> RTree {
        let mut t = self.clone();
        while let RTree::Rec(j, defs) = &t {
            match defs.get(*j) {
                Some(def) => t = def.subst_rec(0, defs),
                None => break,
            }
        }
        t
    }

    /// Equality up to unfolding of recursive binders.
    pub fn equal(&self, other: &RTree) -> bool {
        self == other || Self::equiv(&mut Vec::new(), self, other)
    }

    fn equiv(histo: &mut Vec<(RTree, RTree)>, t: &RTree, u: &RTree) -> bool {
        if histo.iter().any(|(a, b)| a == t && b == u) {
            return true;
        }
        let te = t.expand();
        let ue = u.expand();
        match (&te, &ue) {
            (RTree::Node(x, v), RTree::Node(y, w)) => {
                if x != y || v.len() != w.len() {
                    return false;
                }
                let mark = histo.len();
                histo.push((t.clone(), u.clone()));
                let sons_ok = v.iter().zip(w).all(|(a, b)| Self::equiv(histo, a, b));
                histo.truncate(mark);
                sons_ok
            }
            _ => te == ue,
        }
    }

    /// Componentwise intersection of the labels of two trees. `None` when
    /// incompatible labels meet anywhere the trees are compared.
    pub fn inter(&self, other: &RTree) -> Option<RTree> {
        Self::inter_rec(&mut Vec::new(), 0, self, other)
    }

    #[allow(clippy::type_complexity)]
    fn inter_rec(
        histo: &mut Vec<((RTree, RTree), (usize, usize))>,
        n: usize,
        t: &RTree,
        u: &RTree,
    ) -> Option<RTree> {
        if let Some((_, coords)) = histo.iter().find(|((a, b), _)| a == t && b == u) {
            let (m, j) = *coords;
            return Some(RTree::Param(n - m - 1, j));
        }
        match (t, u) {
            (RTree::Param(i, j), RTree::Param(i2, j2)) => {
                if i == i2 && j == j2 {
                    Some(t.clone())
                } else {
                    None
                }
            }
            (RTree::Node(x, v), RTree::Node(y, w)) => {
                let label = inter_recarg(x, y)?;
                if v.len() != w.len() {
                    return None;
                }
                let sons = v
                    .iter()
                    .zip(w)
                    .map(|(a, b)| Self::inter_rec(histo, n, a, b))
                    .collect::<Option<Vec<_>>>()?;
                Some(RTree::Node(label, sons))
            }
            (RTree::Rec(i, v), RTree::Rec(i2, w)) => {
                if i == i2 && v.len() == w.len() {
                    // keep the shape of the inputs
                    let mark = histo.len();
                    histo.push(((t.clone(), u.clone()), (n, *i)));
                    let defs = v
                        .iter()
                        .zip(w)
                        .map(|(a, b)| Self::inter_rec(histo, n + 1, a, b))
                        .collect::<Option<Vec<_>>>();
                    histo.truncate(mark);
                    Some(RTree::Rec(*i, defs?))
                } else {
                    // mismatched families become a nested tree
                    let mark = histo.len();
                    histo.push(((t.clone(), u.clone()), (n, 0)));
                    let body = Self::inter_rec(histo, n + 1, &t.expand(), &u.expand());
                    histo.truncate(mark);
                    Some(RTree::Rec(0, vec![body?]))
                }
            }
            (RTree::Rec(..), _) => Self::inter_rec(histo, n, &t.expand(), u),
            (_, RTree::Rec(..)) => Self::inter_rec(histo, n, t, &u.expand()),
            _ => None,
        }
    }

    /// Inclusion: intersecting with `other` gives `self` back. `Norec`
    /// sits below every other tree.
    pub fn incl(&self, other: &RTree) -> bool {
        Self::incl_rec(&mut Vec::new(), self, other)
    }

    fn incl_rec(histo: &mut Vec<(RTree, RTree)>, t: &RTree, u: &RTree) -> bool {
        if histo.iter().any(|(a, b)| a == t && b == u) {
            return true;
        }
        let te = t.expand();
        let ue = u.expand();
        match (&te, &ue) {
            (RTree::Node(x, v), RTree::Node(y, w)) => match inter_recarg(x, y) {
                None => *x == Recarg::Norec && v.is_empty(),
                Some(z) => {
                    if z != *x || v.len() != w.len() {
                        return false;
                    }
                    let mark = histo.len();
                    histo.push((t.clone(), u.clone()));
                    let sons_ok = v.iter().zip(w).all(|(a, b)| Self::incl_rec(histo, a, b));
                    histo.truncate(mark);
                    sons_ok
                }
            },
            _ => te == ue,
        }
    }

    /// Root label after unfolding; `None` on a malformed (open) tree.
    pub fn dest_recarg(&self) -> Option<Recarg> {
        match self.expand() {
            RTree::Node(r, _) => Some(r),
            _ => None,
        }
    }

    /// The per-constructor argument trees of an inductive-shaped tree.
    pub fn dest_subterms(&self) -> Option<Vec<Vec<RTree>>> {
        match self.expand() {
            RTree::Node(_, cons) => cons
                .into_iter()
                .map(|c| match c.expand() {
                    RTree::Node(_, args) => Some(args),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ind(name: &str) -> IndRef {
        IndRef::new(name, 0)
    }

    // Nat: zero | succ Nat
    fn nat_tree() -> RTree {
        let def = RTree::node(
            Recarg::Mrec(ind("Nat")),
            vec![
                RTree::node(Recarg::Norec, vec![]),
                RTree::node(Recarg::Norec, vec![RTree::Param(0, 0)]),
            ],
        );
        RTree::mk_rec(&[def]).remove(0)
    }

    // List: nil | cons A (List A)
    fn list_tree() -> RTree {
        let def = RTree::node(
            Recarg::Mrec(ind("List")),
            vec![
                RTree::node(Recarg::Norec, vec![]),
                RTree::node(Recarg::Norec, vec![RTree::norec(), RTree::Param(0, 0)]),
            ],
        );
        RTree::mk_rec(&[def]).remove(0)
    }

    #[test]
    fn test_inter_idempotent() {
        for t in [nat_tree(), list_tree(), RTree::norec()] {
            let i = t.inter(&t).expect("self intersection");
            assert!(i.equal(&t), "inter(t, t) != t for {:?}", t);
        }
    }

    #[test]
    fn test_norec_included_everywhere() {
        assert!(RTree::norec().incl(&nat_tree()));
        assert!(RTree::norec().incl(&list_tree()));
        assert!(RTree::norec().incl(&RTree::norec()));
        assert!(!nat_tree().incl(&RTree::norec()));
    }

    #[test]
    fn test_equal_unfolding() {
        let t = nat_tree();
        // expanding a cyclic tree once does not change it
        assert!(t.equal(&t.expand()));
        assert!(t.expand().equal(&t));
        assert!(!t.equal(&list_tree()));
    }

    #[test]
    fn test_equal_is_reflexive_and_symmetric() {
        let t = list_tree();
        let u = list_tree();
        assert!(t.equal(&t));
        assert!(t.equal(&u) && u.equal(&t));
    }

    #[test]
    fn test_inter_commutative() {
        let nat = ind("Nat");
        let mrec = RTree::node(Recarg::Mrec(nat.clone()), vec![RTree::norec()]);
        let imbr = RTree::node(Recarg::Imbr(nat.clone()), vec![RTree::norec()]);
        let a = mrec.inter(&imbr).expect("compatible labels");
        let b = imbr.inter(&mrec).expect("compatible labels");
        assert!(a.equal(&b));
        // Mrec absorbs Imbr of the same inductive
        assert!(matches!(a.expand(), RTree::Node(Recarg::Mrec(i), _) if i == nat));
    }

    #[test]
    fn test_inter_incompatible() {
        let a = RTree::node(Recarg::Mrec(ind("Nat")), vec![]);
        let b = RTree::node(Recarg::Mrec(ind("Bool")), vec![]);
        assert!(a.inter(&b).is_none());
        // Norec against a recursive label is incompatible too
        assert!(RTree::norec().inter(&a).is_none());
    }

    #[test]
    fn test_incl_against_foreign_tree_is_false() {
        let a = RTree::node(Recarg::Mrec(ind("Nat")), vec![]);
        let b = RTree::node(Recarg::Mrec(ind("Bool")), vec![]);
        assert!(!a.incl(&b));
    }

    #[test]
    fn test_mrec_included_in_imbr() {
        let nat = ind("Nat");
        let mrec = RTree::node(Recarg::Mrec(nat.clone()), vec![]);
        let imbr = RTree::node(Recarg::Imbr(nat), vec![]);
        assert!(mrec.incl(&imbr));
        assert!(!imbr.incl(&mrec));
    }

    #[test]
    fn test_dest_subterms() {
        let subs = nat_tree().dest_subterms().expect("nat is inductive-shaped");
        assert_eq!(subs.len(), 2);
        assert!(subs[0].is_empty());
        assert_eq!(subs[1].len(), 1);
        // the successor argument loops back to Nat itself
        assert!(subs[1][0].equal(&nat_tree()));
    }

    #[test]
    fn test_dest_recarg() {
        assert_eq!(
            nat_tree().dest_recarg(),
            Some(Recarg::Mrec(ind("Nat")))
        );
        assert_eq!(RTree::norec().dest_recarg(), Some(Recarg::Norec));
    }

    #[test]
    fn test_lift_shifts_free_params() {
        let t = RTree::Param(0, 1);
        assert_eq!(t.lift(2), RTree::Param(2, 1));
        // bound back-references are untouched
        let bound = RTree::Rec(0, vec![RTree::Param(0, 0)]);
        assert_eq!(bound.lift(3), RTree::Rec(0, vec![RTree::Param(0, 0)]));
    }
}
