//! The guardedness checker.
//!
//! Given a mutual fixpoint, [`check_fix`] verifies that every recursive
//! call is made on a structurally smaller argument. The check walks the
//! bodies while maintaining, for every variable in scope, a *subterm spec*
//! describing whether the variable is known to be a (strict) subterm of
//! the decreasing argument, and a stack of deferred applicants so that a
//! lambda met inside a match branch can be paired with what would be
//! applied to it once the match reduces.
//!
//! Subterm information is refined through pattern matching by
//! recursive-argument trees ([`crate::rtree`]); matching on a value of a
//! nested inductive instantiates the container's tree on the fly
//! (`build_recargs_nested`) so that the inner elements still count as
//! subterms of the outer value.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::trace;

use crate::ast::{
    self, CaseInfo, ConstantBody, Constructor, Finiteness, IndRef, Level, MutInductive,
    OneInductive, RecDef, Term,
};
use crate::reduce::{self, Fuel};
use crate::rtree::{RTree, Recarg, WfPaths};
use crate::GuardError;

// =============================================================================
// Environments
// =============================================================================

/// A local declaration: an assumption or a let-bound definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelDecl {
    Assum(Rc<Term>),
    /// Body and type of a let-bound variable.
    Def(Rc<Term>, Rc<Term>),
}

/// de Bruijn context of local declarations; index 0 is the most recent.
#[derive(Debug, Clone, Default)]
pub struct Context {
    decls: Vec<RelDecl>,
}

impl Context {
    pub fn new() -> Context {
        Context { decls: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    pub fn push(&self, d: RelDecl) -> Context {
        let mut decls = self.decls.clone();
        decls.push(d);
        Context { decls }
    }

    pub fn push_assum(&self, ty: Rc<Term>) -> Context {
        self.push(RelDecl::Assum(ty))
    }

    pub fn push_def(&self, body: Rc<Term>, ty: Rc<Term>) -> Context {
        self.push(RelDecl::Def(body, ty))
    }

    pub fn get(&self, idx: usize) -> Option<&RelDecl> {
        let pos = self.decls.len().checked_sub(idx + 1)?;
        self.decls.get(pos)
    }
}

/// Global environment: inductive blocks and constants, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Env {
    inductives: HashMap<String, Rc<MutInductive>>,
    constants: HashMap<String, Rc<ConstantBody>>,
}

impl Env {
    pub fn new() -> Env {
        Env::default()
    }

    pub fn add_inductive(&mut self, name: &str, mib: MutInductive) {
        self.inductives.insert(name.to_string(), Rc::new(mib));
    }

    pub fn add_constant(&mut self, name: &str, cb: ConstantBody) {
        self.constants.insert(name.to_string(), Rc::new(cb));
    }

    pub fn lookup_mind(&self, name: &str) -> Result<&Rc<MutInductive>, GuardError> {
        self.inductives
            .get(name)
            .ok_or_else(|| GuardError::UnboundGlobal(name.to_string()))
    }

    pub fn lookup_mind_specif(
        &self,
        ind: &IndRef,
    ) -> Result<(&MutInductive, &OneInductive), GuardError> {
        let mib = self.lookup_mind(&ind.name)?;
        let oib = mib.bodies.get(ind.index).ok_or(GuardError::BadInductiveIndex {
            name: ind.name.clone(),
            index: ind.index,
        })?;
        Ok((mib, oib))
    }

    pub fn lookup_constant(&self, name: &str) -> Option<&Rc<ConstantBody>> {
        self.constants.get(name)
    }
}

// =============================================================================
// Recargs-tree operations
// =============================================================================

/// `true` when the label is a direct or nested occurrence of `ind`.
fn match_inductive(ind: &IndRef, ra: &Recarg) -> bool {
    match ra {
        Recarg::Mrec(i) | Recarg::Imbr(i) => i == ind,
        Recarg::Norec => false,
    }
}

fn inter_wf_paths(a: &WfPaths, b: &WfPaths) -> Result<WfPaths, GuardError> {
    a.inter(b)
        .ok_or(GuardError::Internal("incompatible recursive-argument trees"))
}

fn dest_subterms(t: &WfPaths) -> Result<Vec<Vec<WfPaths>>, GuardError> {
    t.dest_subterms().ok_or(GuardError::Internal(
        "recursive-argument tree is not inductive-shaped",
    ))
}

// =============================================================================
// Subterm specs
// =============================================================================

/// Size attached to a subterm claim. `Loose` is reserved for the recursive
/// argument itself (or an equal term); only `Strict` justifies a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Size {
    Loose,
    Strict,
}

fn size_glb(a: Size, b: Size) -> Size {
    if a == Size::Strict && b == Size::Strict {
        Size::Strict
    } else {
        Size::Loose
    }
}

/// What the checker knows about a term relative to the decreasing
/// argument of the enclosing fixpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SubtermSpec {
    /// Absurd branch; compatible with anything.
    DeadCode,
    NotSubterm,
    Subterm(Size, WfPaths),
}

/// `Strict` subterm for a tree that allows recursion, `NotSubterm` for a
/// tree that does not.
fn spec_of_tree(t: WfPaths) -> SubtermSpec {
    if t.is_norec() {
        SubtermSpec::NotSubterm
    } else {
        SubtermSpec::Subterm(Size::Strict, t)
    }
}

fn spec_glb2(a: &SubtermSpec, b: &SubtermSpec) -> Result<SubtermSpec, GuardError> {
    use SubtermSpec::*;
    match (a, b) {
        (DeadCode, s) | (s, DeadCode) => Ok(s.clone()),
        (NotSubterm, _) | (_, NotSubterm) => Ok(NotSubterm),
        (Subterm(s1, t1), Subterm(s2, t2)) => {
            Ok(Subterm(size_glb(*s1, *s2), inter_wf_paths(t1, t2)?))
        }
    }
}

/// Greatest lower bound of a family of specs; empty families are dead
/// code (a match with no branches).
fn spec_glb(specs: &[SubtermSpec]) -> Result<SubtermSpec, GuardError> {
    let mut acc = SubtermSpec::DeadCode;
    for s in specs {
        acc = spec_glb2(&acc, s)?;
    }
    Ok(acc)
}

// =============================================================================
// Guard environment and stack
// =============================================================================

/// Per-fixpoint checking state: the local context, the de Bruijn index of
/// the last fixpoint of the current block, and the specs of in-scope
/// variables (most recent last; indices beyond the vector are
/// `NotSubterm`).
#[derive(Debug, Clone)]
struct GuardEnv {
    ctx: Context,
    rel_min_fix: usize,
    guarded: Vec<SubtermSpec>,
}

impl GuardEnv {
    fn new(ctx: Context, rel_min_fix: usize, rec_arg_spec: SubtermSpec) -> GuardEnv {
        GuardEnv {
            ctx,
            rel_min_fix,
            guarded: vec![rec_arg_spec],
        }
    }

    fn lookup_subterm(&self, k: usize) -> SubtermSpec {
        match self.guarded.len().checked_sub(k + 1) {
            Some(i) => self.guarded[i].clone(),
            None => SubtermSpec::NotSubterm,
        }
    }

    fn push_var(&self, ty: &Rc<Term>, spec: SubtermSpec) -> GuardEnv {
        let mut guarded = self.guarded.clone();
        guarded.push(spec);
        GuardEnv {
            ctx: self.ctx.push_assum(ty.clone()),
            rel_min_fix: self.rel_min_fix + 1,
            guarded,
        }
    }

    fn push_var_norec(&self, ty: &Rc<Term>) -> GuardEnv {
        self.push_var(ty, SubtermSpec::NotSubterm)
    }

    fn push_decl_norec(&self, d: &RelDecl) -> GuardEnv {
        let mut guarded = self.guarded.clone();
        guarded.push(SubtermSpec::NotSubterm);
        GuardEnv {
            ctx: self.ctx.push(d.clone()),
            rel_min_fix: self.rel_min_fix + 1,
            guarded,
        }
    }

    /// Bind the names of a (co)fixpoint block, all as non-subterms.
    fn push_fix_types(&self, defs: &RecDef) -> GuardEnv {
        let mut g = self.clone();
        for (i, ty) in defs.types.iter().enumerate() {
            g = g.push_var_norec(&ty.shift(0, i));
        }
        g
    }

    /// Replace the spec of the variable at de Bruijn index `k`.
    fn assign_spec(&mut self, k: usize, spec: SubtermSpec) -> Result<(), GuardError> {
        let i = self
            .guarded
            .len()
            .checked_sub(k + 1)
            .ok_or(GuardError::Internal("guard environment index out of range"))?;
        self.guarded[i] = spec;
        Ok(())
    }
}

/// Deferred applicant: a term whose spec has not been computed yet,
/// together with its environment, or an already-computed spec.
#[derive(Debug, Clone)]
enum StackElem {
    Closure(GuardEnv, Rc<Term>),
    Arg(SubtermSpec),
}

/// Entry 0 is the next argument to be consumed.
type Stack = Vec<StackElem>;

fn push_stack_closures(renv: &GuardEnv, args: &[Rc<Term>], stack: &[StackElem]) -> Stack {
    args.iter()
        .map(|a| StackElem::Closure(renv.clone(), a.clone()))
        .chain(stack.iter().cloned())
        .collect()
}

fn push_stack_args(specs: &[SubtermSpec], stack: &[StackElem]) -> Stack {
    specs
        .iter()
        .map(|s| StackElem::Arg(s.clone()))
        .chain(stack.iter().cloned())
        .collect()
}

fn stack_element_specif(
    env: &Env,
    fuel: &Fuel,
    elem: &StackElem,
) -> Result<SubtermSpec, GuardError> {
    match elem {
        StackElem::Closure(renv, t) => subterm_specif(env, fuel, renv, &[], t),
        StackElem::Arg(s) => Ok(s.clone()),
    }
}

fn extract_stack<'a>(
    env: &Env,
    fuel: &Fuel,
    stack: &'a [StackElem],
) -> Result<(SubtermSpec, &'a [StackElem]), GuardError> {
    match stack.split_first() {
        Some((head, rest)) => Ok((stack_element_specif(env, fuel, head)?, rest)),
        None => Ok((SubtermSpec::NotSubterm, &[])),
    }
}

// =============================================================================
// Destructuring under reduction
// =============================================================================

/// Strip all products of `ty` under full weak-head reduction.
fn dest_prod(
    env: &Env,
    ctx: &Context,
    ty: &Rc<Term>,
    fuel: &Fuel,
) -> Result<(Context, Rc<Term>), GuardError> {
    let mut ctx = ctx.clone();
    let mut ty = ty.clone();
    loop {
        let t = reduce::whd_all(env, &ctx, &ty, fuel)?;
        match &*t {
            Term::Prod(a, b) => {
                ctx = ctx.push_assum(a.clone());
                ty = b.clone();
            }
            _ => return Ok((ctx, t)),
        }
    }
}

/// Strip products and lets, reducing lazily and only trying full
/// reduction when the lazy pass gets stuck.
fn dest_prod_assum(
    env: &Env,
    ctx: &Context,
    ty: &Rc<Term>,
    fuel: &Fuel,
) -> Result<(Context, Rc<Term>), GuardError> {
    let mut ctx = ctx.clone();
    let mut ty = ty.clone();
    loop {
        let t = reduce::whd_all_nolet(env, &ctx, &ty, fuel)?;
        match &*t {
            Term::Prod(a, b) => {
                ctx = ctx.push_assum(a.clone());
                ty = b.clone();
            }
            Term::LetIn(a, v, b) => {
                ctx = ctx.push_def(v.clone(), a.clone());
                ty = b.clone();
            }
            _ => {
                let t2 = reduce::whd_all(env, &ctx, &t, fuel)?;
                if t2 == t {
                    return Ok((ctx, t));
                }
                ty = t2;
            }
        }
    }
}

/// Strip lambdas and lets under reduction.
fn dest_lam_assum(
    env: &Env,
    ctx: &Context,
    t: &Rc<Term>,
    fuel: &Fuel,
) -> Result<(Context, Rc<Term>), GuardError> {
    let mut ctx = ctx.clone();
    let mut t = t.clone();
    loop {
        let r = reduce::whd_all_nolet(env, &ctx, &t, fuel)?;
        match &*r {
            Term::Lambda(a, b) => {
                ctx = ctx.push_assum(a.clone());
                t = b.clone();
            }
            Term::LetIn(a, v, b) => {
                ctx = ctx.push_def(v.clone(), a.clone());
                t = b.clone();
            }
            _ => return Ok((ctx, r)),
        }
    }
}

/// Apply a product type to arguments, reducing to expose each product.
fn hnf_prod_apps(
    env: &Env,
    ctx: &Context,
    ty: &Rc<Term>,
    args: &[Rc<Term>],
    fuel: &Fuel,
) -> Result<Rc<Term>, GuardError> {
    let mut ty = ty.clone();
    for a in args {
        let t = reduce::whd_all(env, ctx, &ty, fuel)?;
        match &*t {
            Term::Prod(_, b) => ty = b.subst(0, a),
            _ => {
                return Err(GuardError::Internal(
                    "too many arguments applied to a product type",
                ))
            }
        }
    }
    Ok(ty)
}

/// Head inductive of a type, after full weak-head reduction.
fn find_rectype(
    env: &Env,
    ctx: &Context,
    ty: &Rc<Term>,
    fuel: &Fuel,
) -> Result<Option<(IndRef, Vec<Rc<Term>>)>, GuardError> {
    let t = reduce::whd_all(env, ctx, ty, fuel)?;
    let (head, args) = ast::decompose_app(&t);
    match &*head {
        Term::Ind(ind, _) => Ok(Some((ind.clone(), args))),
        _ => Ok(None),
    }
}

/// Split `n` leading lambdas, collecting interleaved lets, without any
/// reduction.
fn decompose_lam_n_assum(
    t: &Rc<Term>,
    n: usize,
) -> Result<(Vec<RelDecl>, Rc<Term>), GuardError> {
    let mut decls = Vec::new();
    let mut t = t.clone();
    let mut lams = 0;
    while lams < n {
        let cur = t.clone();
        match &*cur {
            Term::Lambda(a, b) => {
                decls.push(RelDecl::Assum(a.clone()));
                lams += 1;
                t = b.clone();
            }
            Term::LetIn(a, v, b) => {
                decls.push(RelDecl::Def(v.clone(), a.clone()));
                t = b.clone();
            }
            Term::Cast(c, _) => t = c.clone(),
            _ => {
                return Err(GuardError::Internal(
                    "not enough abstractions in fixpoint body",
                ))
            }
        }
    }
    Ok((decls, t))
}

// =============================================================================
// Uniform parameters
// =============================================================================

/// Number of parameters every recursive self-reference instantiates
/// uniformly: the longest prefix of constructor-conclusion arguments that
/// are parameter variables, minimized over all constructors and bodies.
fn num_uniform_params(mib: &MutInductive) -> usize {
    let npars = mib.npars;
    let mut uniform = npars;
    for oib in &mib.bodies {
        for ctor in &oib.ctors {
            let mut depth = 0usize;
            let mut ty = ctor.ty.clone();
            loop {
                let cur = ty.clone();
                match &*cur {
                    Term::Prod(_, b) | Term::LetIn(_, _, b) => {
                        depth += 1;
                        ty = b.clone();
                    }
                    Term::Cast(c, _) => ty = c.clone(),
                    _ => break,
                }
            }
            let (_, args) = ast::decompose_app(&ty);
            let mut prefix = 0;
            for a in args.iter().take(npars) {
                match &**a {
                    Term::Rel(k) if *k < depth && *k + npars >= depth => prefix += 1,
                    _ => break,
                }
            }
            uniform = uniform.min(prefix);
        }
    }
    uniform
}

// =============================================================================
// Recargs-tree builder for nested inductives
// =============================================================================

/// Recarg information for the variables of the context being traversed;
/// entry 0 describes the most recent binder.
type RaEnv = Vec<(Recarg, WfPaths)>;

fn ra_env_push_var(ctx: &Context, ra: &RaEnv, ty: &Rc<Term>) -> (Context, RaEnv) {
    let mut ra2 = ra.clone();
    ra2.insert(0, (Recarg::Norec, RTree::norec()));
    (ctx.push_assum(ty.clone()), ra2)
}

/// Bind one assumption per body of `block`, instantiated with the uniform
/// parameters, and the matching `Imbr` recarg entries.
fn ra_env_push_inductive(
    env: &Env,
    ctx: &Context,
    ra: &RaEnv,
    block: &str,
    lpar: &[Rc<Term>],
    fuel: &Fuel,
) -> Result<(Context, RaEnv), GuardError> {
    let mib = env.lookup_mind(block)?.clone();
    let ntypes = mib.bodies.len();
    let mut ctx2 = ctx.clone();
    for oib in &mib.bodies {
        let ty = hnf_prod_apps(env, &ctx2, &oib.arity, lpar, fuel)?;
        ctx2 = ctx2.push_assum(ty);
    }
    let mut ra2: RaEnv = ra.iter().map(|(r, t)| (r.clone(), t.lift(ntypes))).collect();
    for (j, t) in RTree::rec_calls(ntypes).into_iter().enumerate() {
        ra2.insert(0, (Recarg::Imbr(IndRef::new(block, j)), t));
    }
    Ok((ctx2, ra2))
}

/// Move `n` leading products into the context as non-recursive entries.
fn ra_env_decompose_prod(
    env: &Env,
    ctx: &Context,
    ra: &RaEnv,
    n: usize,
    c: &Rc<Term>,
    fuel: &Fuel,
) -> Result<(Context, RaEnv, Rc<Term>), GuardError> {
    let mut ctx = ctx.clone();
    let mut ra = ra.clone();
    let mut c = c.clone();
    for _ in 0..n {
        let t = reduce::whd_all(env, &ctx, &c, fuel)?;
        match &*t {
            Term::Prod(a, b) => {
                let (c2, r2) = ra_env_push_var(&ctx, &ra, a);
                ctx = c2;
                ra = r2;
                c = b.clone();
            }
            _ => {
                return Err(GuardError::Internal(
                    "expected a product while skipping non-uniform parameters",
                ))
            }
        }
    }
    Ok((ctx, ra, c))
}

fn dummy_sort() -> Rc<Term> {
    Term::sort(Level::Succ(Box::new(Level::Zero)))
}

/// `n` implicit lambdas in front of `t`, keeping its references intact.
fn lambda_implicit_lift(n: usize, t: Rc<Term>) -> Rc<Term> {
    let mut t = t.shift(0, n);
    for _ in 0..n {
        t = Term::lam(dummy_sort(), t);
    }
    t
}

/// λ-abstract the parameters in front of each block self-reference, so
/// that instantiating the parameters leaves the reference unchanged.
fn abstract_mind_lc(ntypes: usize, npars: usize, ctors: &[Constructor]) -> Vec<Rc<Term>> {
    if npars == 0 {
        return ctors.iter().map(|c| c.ty.clone()).collect();
    }
    let subs: Vec<Rc<Term>> = (0..ntypes)
        .map(|k| lambda_implicit_lift(npars, Term::rel(k)))
        .collect();
    ctors.iter().map(|c| c.ty.subst_many(0, &subs)).collect()
}

fn mk_paths(label: Recarg, ctor_trees: Vec<Vec<WfPaths>>) -> WfPaths {
    RTree::node(
        label,
        ctor_trees
            .into_iter()
            .map(|l| RTree::node(Recarg::Norec, l))
            .collect(),
    )
}

/// Instantiate the recargs tree of a nested occurrence of `ind` applied
/// to `largs`, using `seed` as the recursion limit: positions the seed
/// does not allow stay non-recursive.
fn build_recargs_nested(
    env: &Env,
    ctx: &Context,
    ra: &RaEnv,
    fuel: &Fuel,
    seed: &WfPaths,
    ind: &IndRef,
    largs: &[Rc<Term>],
) -> Result<WfPaths, GuardError> {
    fuel.tick()?;
    if seed.is_norec() {
        return Ok(seed.clone());
    }
    let mib = env.lookup_mind(&ind.name)?.clone();
    let auxntyp = mib.bodies.len();
    let auxnpar = num_uniform_params(&mib);
    let nonrecpar = mib.npars - auxnpar;
    let lpar = &largs[..auxnpar.min(largs.len())];
    let (ctx2, ra2) = ra_env_push_inductive(env, ctx, ra, &ind.name, lpar, fuel)?;
    let lpar2: Vec<Rc<Term>> = lpar.iter().map(|t| t.shift(0, auxntyp)).collect();
    // For mutual containers the statically computed trees are used: nested
    // inductives with mutually recursive containers are not supported.
    let seed_trees: Vec<Vec<Vec<WfPaths>>> = if auxntyp == 1 {
        vec![dest_subterms(seed)?]
    } else {
        mib.bodies
            .iter()
            .map(|o| dest_subterms(&o.recargs))
            .collect::<Result<_, _>>()?
    };
    let mut ind_paths = Vec::with_capacity(auxntyp);
    for (j, oib) in mib.bodies.iter().enumerate() {
        let abs_lc = abstract_mind_lc(auxntyp, auxnpar, &oib.ctors);
        let mut paths = Vec::with_capacity(abs_lc.len());
        for (k, cty) in abs_lc.iter().enumerate() {
            let cty = hnf_prod_apps(env, &ctx2, cty, &lpar2, fuel)?;
            let (ctx3, ra3, cty) = ra_env_decompose_prod(env, &ctx2, &ra2, nonrecpar, &cty, fuel)?;
            let seeds_k = seed_trees[j].get(k).ok_or(GuardError::Internal(
                "recursive-argument tree does not cover all constructors",
            ))?;
            paths.push(build_recargs_constructors(env, &ctx3, &ra3, fuel, seeds_k, &cty)?);
        }
        ind_paths.push(mk_paths(Recarg::Imbr(IndRef::new(&ind.name, j)), paths));
    }
    let family = RTree::mk_rec(&ind_paths);
    family
        .get(ind.index)
        .cloned()
        .ok_or(GuardError::BadInductiveIndex {
            name: ind.name.clone(),
            index: ind.index,
        })
}

/// The tree of one constructor-argument type.
fn build_recargs(
    env: &Env,
    ctx: &Context,
    ra: &RaEnv,
    fuel: &Fuel,
    seed: &WfPaths,
    c: &Rc<Term>,
) -> Result<WfPaths, GuardError> {
    fuel.tick()?;
    let t = reduce::whd_all(env, ctx, c, fuel)?;
    let (head, largs) = ast::decompose_app(&t);
    match &*head {
        Term::Prod(a, b) => {
            if !largs.is_empty() {
                return Err(GuardError::Internal("applied product in a constructor argument"));
            }
            let (ctx2, ra2) = ra_env_push_var(ctx, ra, a);
            build_recargs(env, &ctx2, &ra2, fuel, seed, b)
        }
        // free variables are allowed and give their recorded tree
        Term::Rel(k) => Ok(ra
            .get(*k)
            .map(|(_, t)| t.clone())
            .unwrap_or_else(RTree::norec)),
        Term::Ind(ind2, _) => match seed.dest_recarg() {
            Some(Recarg::Mrec(ref i)) | Some(Recarg::Imbr(ref i)) if i == ind2 => {
                build_recargs_nested(env, ctx, ra, fuel, seed, ind2, &largs)
            }
            _ => Ok(RTree::norec()),
        },
        _ => Ok(RTree::norec()),
    }
}

/// Walk the products of a constructor type, consuming one seed tree per
/// argument.
fn build_recargs_constructors(
    env: &Env,
    ctx: &Context,
    ra: &RaEnv,
    fuel: &Fuel,
    seeds: &[WfPaths],
    c: &Rc<Term>,
) -> Result<Vec<WfPaths>, GuardError> {
    let mut ctx = ctx.clone();
    let mut ra = ra.clone();
    let mut c = c.clone();
    let mut out = Vec::new();
    loop {
        let t = reduce::whd_all(env, &ctx, &c, fuel)?;
        match &*t {
            Term::Prod(a, b) => {
                let seed = seeds.get(out.len()).ok_or(GuardError::Internal(
                    "constructor has more arguments than its recursive-argument tree",
                ))?;
                out.push(build_recargs(env, &ctx, &ra, fuel, seed, a)?);
                let (c2, r2) = ra_env_push_var(&ctx, &ra, a);
                ctx = c2;
                ra = r2;
                c = b.clone();
            }
            _ => return Ok(out),
        }
    }
}

// =============================================================================
// Restriction by the match return type
// =============================================================================

/// Refine a spec by what the match return-type function says about the
/// value being produced. Non-dependent return types restrict nothing.
fn restrict_spec_for_match(
    env: &Env,
    ctx: &Context,
    fuel: &Fuel,
    spec: SubtermSpec,
    rtf: &Rc<Term>,
) -> Result<SubtermSpec, GuardError> {
    if spec == SubtermSpec::NotSubterm {
        return Ok(spec);
    }
    let (ctx2, body) = dest_lam_assum(env, ctx, rtf, fuel)?;
    let nbinders = ctx2.len() - ctx.len();
    if body.noccur_with_evars(0, nbinders) {
        return Ok(spec);
    }
    let (ctx3, concl) = dest_prod_assum(env, &ctx2, &body, fuel)?;
    let whd_concl = reduce::whd_all(env, &ctx3, &concl, fuel)?;
    let (head, args) = ast::decompose_app(&whd_concl);
    if let Term::Ind(ind, _) = &*head {
        match spec {
            SubtermSpec::DeadCode => Ok(SubtermSpec::DeadCode),
            SubtermSpec::Subterm(sz, tree) => {
                let approx = build_recargs_nested(env, &ctx3, &Vec::new(), fuel, &tree, ind, &args)?;
                Ok(SubtermSpec::Subterm(sz, inter_wf_paths(&tree, &approx)?))
            }
            SubtermSpec::NotSubterm => Ok(SubtermSpec::NotSubterm),
        }
    } else {
        Ok(SubtermSpec::NotSubterm)
    }
}

/// Align the stack with the products of the match return type, refining
/// entries of inductive type and forgetting the rest. Entries beyond the
/// return type's arity lose their spec information.
fn filter_stack_domain(
    env: &Env,
    ctx: &Context,
    fuel: &Fuel,
    rtf: &Rc<Term>,
    stack: Stack,
) -> Result<Stack, GuardError> {
    let (mut fctx, ar) = dest_lam_assum(env, ctx, rtf, fuel)?;
    let nbinders = fctx.len() - ctx.len();
    if ar.noccur_with_evars(0, nbinders) {
        return Ok(stack);
    }
    let mut ar = ar;
    let mut out: Stack = Vec::with_capacity(stack.len());
    let mut it = stack.into_iter();
    while let Some(elt) = it.next() {
        let t = reduce::whd_all(env, &fctx, &ar, fuel)?;
        let Term::Prod(a, c0) = &*t else {
            out.push(StackElem::Arg(SubtermSpec::NotSubterm));
            for _ in it.by_ref() {
                out.push(StackElem::Arg(SubtermSpec::NotSubterm));
            }
            break;
        };
        let a_whd = reduce::whd_all(env, &fctx, a, fuel)?;
        let (h, ind_args) = ast::decompose_app(&a_whd);
        let elt2 = if let Term::Ind(ind, _) = &*h {
            match stack_element_specif(env, fuel, &elt)? {
                SubtermSpec::Subterm(sz, path) => {
                    let approx =
                        build_recargs_nested(env, &fctx, &Vec::new(), fuel, &path, ind, &ind_args)?;
                    StackElem::Arg(SubtermSpec::Subterm(sz, inter_wf_paths(&path, &approx)?))
                }
                _ => elt,
            }
        } else {
            StackElem::Arg(SubtermSpec::NotSubterm)
        };
        out.push(elt2);
        fctx = fctx.push_assum(a.clone());
        ar = c0.clone();
    }
    Ok(out)
}

// =============================================================================
// Subterm inference
// =============================================================================

/// Specs for the variables bound by each branch of a match on a value
/// whose spec is `discr`. Strictness is born here: matching on a `Loose`
/// (or `Strict`) value makes the constructor arguments `Strict`.
fn branches_specif(
    env: &Env,
    discr: &SubtermSpec,
    ci: &CaseInfo,
) -> Result<Vec<Vec<SubtermSpec>>, GuardError> {
    let (_, oib) = env.lookup_mind_specif(&ci.ind)?;
    // the static tree fixes the number of constructors and their arities
    let arities: Vec<usize> = dest_subterms(&oib.recargs)?
        .iter()
        .map(|v| v.len())
        .collect();
    arities
        .iter()
        .enumerate()
        .map(|(i, &nca)| match discr {
            SubtermSpec::Subterm(_, t)
                if t.dest_recarg().is_some_and(|r| match_inductive(&ci.ind, &r)) =>
            {
                let subs = dest_subterms(t)?;
                let vra = subs.get(i).ok_or(GuardError::Internal(
                    "discriminant tree does not cover all constructors",
                ))?;
                if vra.len() != nca {
                    return Err(GuardError::Internal(
                        "branch arity differs from the discriminant tree",
                    ));
                }
                Ok(vra.iter().map(|t| spec_of_tree(t.clone())).collect())
            }
            SubtermSpec::DeadCode => Ok(vec![SubtermSpec::DeadCode; nca]),
            _ => Ok(vec![SubtermSpec::NotSubterm; nca]),
        })
        .collect()
}

/// Infer a subterm spec for `t` under a stack of deferred applicants.
fn subterm_specif(
    env: &Env,
    fuel: &Fuel,
    renv: &GuardEnv,
    stack: &[StackElem],
    t: &Rc<Term>,
) -> Result<SubtermSpec, GuardError> {
    fuel.tick()?;
    let t = reduce::whd_all(env, &renv.ctx, t, fuel)?;
    let (head, l) = ast::decompose_app(&t);
    match &*head {
        // applications do not lose subterm status, so the stack is dropped
        Term::Rel(k) => Ok(renv.lookup_subterm(*k)),
        Term::Case(ci, p, discr, brs) => {
            let stack2 = push_stack_closures(renv, &l, stack);
            let d_spec = subterm_specif(env, fuel, renv, &[], discr)?;
            let cases_spec = branches_specif(env, &d_spec, ci)?;
            let mut branch_specs = Vec::with_capacity(brs.len());
            for (i, br) in brs.iter().enumerate() {
                let specs_i = cases_spec.get(i).ok_or(GuardError::Internal(
                    "match has more branches than the inductive has constructors",
                ))?;
                let stack_br = push_stack_args(specs_i, &stack2);
                branch_specs.push(subterm_specif(env, fuel, renv, &stack_br, br)?);
            }
            let spec = spec_glb(&branch_specs)?;
            restrict_spec_for_match(env, &renv.ctx, fuel, spec, p)
        }
        Term::Fix(rec_args, ix, defs) => {
            // A fixpoint returns a subterm of its decreasing argument; mark
            // it Strict so its own recursive calls are recognized, and seed
            // the decreasing slot from the application site when available.
            if *ix >= defs.len() || defs.types.len() != defs.len() {
                return Err(GuardError::Internal("ill-formed fixpoint block"));
            }
            let ty_i = defs
                .types
                .get(*ix)
                .ok_or(GuardError::Internal("fixpoint block without a type"))?;
            let (cctx, concl) = dest_prod(env, &renv.ctx, ty_i, fuel)?;
            let Some((ind, _)) = find_rectype(env, &cctx, &concl, fuel)? else {
                return Ok(SubtermSpec::NotSubterm);
            };
            let Ok((_, oib)) = env.lookup_mind_specif(&ind) else {
                return Ok(SubtermSpec::NotSubterm);
            };
            let rectree = oib.recargs.clone();
            let nbfix = defs.len();
            let mut renv2 = renv.push_fix_types(defs);
            renv2.assign_spec(nbfix - 1 - ix, SubtermSpec::Subterm(Size::Strict, rectree))?;
            let rarg = *rec_args
                .get(*ix)
                .ok_or(GuardError::Internal("fixpoint block without a decreasing index"))?;
            let body = defs
                .bodies
                .get(*ix)
                .ok_or(GuardError::Internal("fixpoint block without a body"))?;
            let (sign, stripped) = decompose_lam_n_assum(body, rarg + 1)?;
            let stack2 = push_stack_closures(renv, &l, stack);
            let mut renv3 = renv2;
            for d in &sign {
                renv3 = renv3.push_decl_norec(d);
            }
            if stack2.len() > rarg {
                let spec = stack_element_specif(env, fuel, &stack2[rarg])?;
                renv3.assign_spec(0, spec)?;
            }
            subterm_specif(env, fuel, &renv3, &[], &stripped)
        }
        Term::Lambda(a, b) => {
            if !l.is_empty() {
                return Err(GuardError::Internal("β-redex survived weak-head reduction"));
            }
            let (spec, rest) = extract_stack(env, fuel, stack)?;
            subterm_specif(env, fuel, &renv.push_var(a, spec), rest, b)
        }
        Term::Evar(_) => Err(GuardError::Unsupported("existential variables")),
        Term::Proj(p, c) => {
            // subterm info flows through the projection with the same stack
            match subterm_specif(env, fuel, renv, stack, c)? {
                SubtermSpec::Subterm(_, tree) => {
                    let subs = dest_subterms(&tree)?;
                    if subs.len() != 1 {
                        return Err(GuardError::Internal(
                            "projection of a value of a non-record inductive",
                        ));
                    }
                    let arg_tree = subs[0]
                        .get(p.arg)
                        .ok_or(GuardError::BadProjectionIndex { arg: p.arg })?;
                    Ok(spec_of_tree(arg_tree.clone()))
                }
                s => Ok(s),
            }
        }
        _ => Ok(SubtermSpec::NotSubterm),
    }
}

/// The decreasing-argument gate: a call is legal when the argument is a
/// strict subterm whose tree includes the expected one, or dead code.
fn check_is_subterm(spec: &SubtermSpec, tree: &WfPaths) -> bool {
    match spec {
        SubtermSpec::Subterm(Size::Strict, t) => tree.incl(t),
        SubtermSpec::DeadCode => true,
        _ => false,
    }
}

// =============================================================================
// The guarded-recursion walker
// =============================================================================

/// Immutable data of one `check_fix` run.
struct FixChecker<'a> {
    env: &'a Env,
    fuel: &'a Fuel,
    /// Decreasing-argument index of each body of the block.
    rec_args: &'a [usize],
    /// Recargs tree of each body's recursion target.
    trees: &'a [WfPaths],
    names: &'a [String],
}

impl FixChecker<'_> {
    fn nfi(&self) -> usize {
        self.rec_args.len()
    }

    /// Verify every recursive call in `t`.
    fn check_rec_call(
        &self,
        renv: &GuardEnv,
        stack: &[StackElem],
        t: &Rc<Term>,
    ) -> Result<(), GuardError> {
        self.fuel.tick()?;
        // if t does not mention the fixpoints at all, it is guarded
        if t.noccur_with_evars(renv.rel_min_fix, self.nfi()) {
            return Ok(());
        }
        let t = reduce::whd_betaiotazeta(self.env, &renv.ctx, t, self.fuel)?;
        let (head, l) = ast::decompose_app(&t);
        match &*head {
            Term::Rel(p) => self.check_rel(renv, stack, *p, &l),
            Term::Case(ci, p, discr, brs) => {
                let attempt = (|| -> Result<(), GuardError> {
                    self.check_rec_call(renv, &[], p)?;
                    self.check_rec_call(renv, &[], discr)?;
                    for a in &l {
                        self.check_rec_call(renv, &[], a)?;
                    }
                    let d_spec = subterm_specif(self.env, self.fuel, renv, &[], discr)?;
                    let cases_spec = branches_specif(self.env, &d_spec, ci)?;
                    let stack2 = push_stack_closures(renv, &l, stack);
                    let stack2 = filter_stack_domain(self.env, &renv.ctx, self.fuel, p, stack2)?;
                    for (k, br) in brs.iter().enumerate() {
                        let specs_k = cases_spec.get(k).ok_or(GuardError::Internal(
                            "match has more branches than the inductive has constructors",
                        ))?;
                        let stack_br = push_stack_args(specs_k, &stack2);
                        self.check_rec_call(renv, &stack_br, br)?;
                    }
                    Ok(())
                })();
                match attempt {
                    Err(err) if err.recoverable() => {
                        // a constructor may hide behind constants; reduce the
                        // discriminant and restart on the reduced match
                        let d2 = reduce::whd_all(self.env, &renv.ctx, discr, self.fuel)?;
                        let (h, _) = ast::decompose_app(&d2);
                        if matches!(&*h, Term::Construct(_, _, _)) {
                            trace!("retrying match with a reduced discriminant");
                            let t2 = ast::mk_app(
                                Rc::new(Term::Case(ci.clone(), p.clone(), d2, brs.clone())),
                                &l,
                            );
                            self.check_rec_call(renv, stack, &t2)
                        } else {
                            Err(err)
                        }
                    }
                    other => other,
                }
            }
            Term::Fix(rec_args_inner, ix, defs) => {
                let attempt = (|| -> Result<(), GuardError> {
                    for a in &l {
                        self.check_rec_call(renv, &[], a)?;
                    }
                    for ty in &defs.types {
                        self.check_rec_call(renv, &[], ty)?;
                    }
                    let decr = *rec_args_inner
                        .get(*ix)
                        .ok_or(GuardError::Internal("fixpoint block without a decreasing index"))?;
                    let renv2 = renv.push_fix_types(defs);
                    let stack2 = push_stack_closures(renv, &l, stack);
                    for (j, body) in defs.bodies.iter().enumerate() {
                        if j == *ix && stack2.len() > decr {
                            // the decreasing argument of the nested fixpoint
                            // is known: bind it with its inferred spec
                            let spec = stack_element_specif(self.env, self.fuel, &stack2[decr])?;
                            self.check_nested_fix_body(renv2.clone(), decr + 1, spec, body)?;
                        } else {
                            self.check_rec_call(&renv2, &[], body)?;
                        }
                    }
                    Ok(())
                })();
                match attempt {
                    Err(err) if err.recoverable() => {
                        let decr = match rec_args_inner.get(*ix) {
                            Some(d) => *d,
                            None => return Err(err),
                        };
                        if l.len() <= decr {
                            return Err(err);
                        }
                        let a2 = reduce::whd_all(self.env, &renv.ctx, &l[decr], self.fuel)?;
                        let (h, _) = ast::decompose_app(&a2);
                        if matches!(&*h, Term::Construct(_, _, _)) {
                            trace!("retrying nested fixpoint with a reduced decreasing argument");
                            let mut l2 = l.clone();
                            l2[decr] = a2;
                            self.check_rec_call(renv, stack, &ast::mk_app(head.clone(), &l2))
                        } else {
                            Err(err)
                        }
                    }
                    other => other,
                }
            }
            Term::Const(kn, _) => {
                let cb = self
                    .env
                    .lookup_constant(kn)
                    .cloned()
                    .ok_or_else(|| GuardError::UnboundGlobal(kn.clone()))?;
                let attempt = l.iter().try_for_each(|a| self.check_rec_call(renv, &[], a));
                match (attempt, &cb.body) {
                    (Err(err), Some(body)) if err.recoverable() => {
                        trace!(constant = %kn, "unfolding a constant to recover");
                        self.check_rec_call(renv, stack, &ast::mk_app(body.clone(), &l))
                    }
                    (other, _) => other,
                }
            }
            Term::Lambda(a, b) => {
                if !l.is_empty() {
                    return Err(GuardError::Internal("β-redex survived weak-head reduction"));
                }
                self.check_rec_call(renv, &[], a)?;
                let (spec, rest) = extract_stack(self.env, self.fuel, stack)?;
                self.check_rec_call(&renv.push_var(a, spec), rest, b)
            }
            Term::Prod(a, b) => {
                if !l.is_empty() {
                    return Err(GuardError::Internal("applied product"));
                }
                self.check_rec_call(renv, &[], a)?;
                self.check_rec_call(&renv.push_var_norec(a), &[], b)
            }
            Term::CoFix(_, defs) => {
                for a in &l {
                    self.check_rec_call(renv, &[], a)?;
                }
                for ty in &defs.types {
                    self.check_rec_call(renv, &[], ty)?;
                }
                let renv2 = renv.push_fix_types(defs);
                defs.bodies
                    .iter()
                    .try_for_each(|b| self.check_rec_call(&renv2, &[], b))
            }
            Term::Ind(_, _) | Term::Construct(_, _, _) => {
                l.iter().try_for_each(|a| self.check_rec_call(renv, &[], a))
            }
            Term::Proj(p, c) => {
                let attempt = (|| -> Result<(), GuardError> {
                    for a in &l {
                        self.check_rec_call(renv, &[], a)?;
                    }
                    self.check_rec_call(renv, &[], c)
                })();
                match attempt {
                    Err(err) if err.recoverable() => {
                        // projection reduction is not implemented; only retry
                        // when reduction made progress, so the error is stable
                        let c2 = reduce::whd_all(self.env, &renv.ctx, c, self.fuel)?;
                        let (h, _) = ast::decompose_app(&c2);
                        if c2 != *c && matches!(&*h, Term::Construct(_, _, _)) {
                            let t2 = ast::mk_app(Rc::new(Term::Proj(p.clone(), c2)), &l);
                            self.check_rec_call(renv, stack, &t2)
                        } else {
                            Err(err)
                        }
                    }
                    other => other,
                }
            }
            Term::Sort(_) => {
                if l.is_empty() {
                    Ok(())
                } else {
                    Err(GuardError::Internal("applied sort"))
                }
            }
            Term::Var(_) => Err(GuardError::Unsupported("named variables")),
            Term::Evar(_) => Err(GuardError::Unsupported("existential variables")),
            Term::App(_, _) | Term::LetIn(_, _, _) | Term::Cast(_, _) => Err(GuardError::Internal(
                "application, let or cast at the head of a weak-head normal form",
            )),
        }
    }

    fn check_rel(
        &self,
        renv: &GuardEnv,
        stack: &[StackElem],
        p: usize,
        l: &[Rc<Term>],
    ) -> Result<(), GuardError> {
        let nfi = self.nfi();
        if p >= renv.rel_min_fix && p < renv.rel_min_fix + nfi {
            // a recursive call
            for a in l {
                self.check_rec_call(renv, &[], a)?;
            }
            let glob = renv.rel_min_fix + nfi - 1 - p;
            let np = self.rec_args[glob];
            let stack2 = push_stack_closures(renv, l, stack);
            trace!(fix = %self.names[glob], arg = np, "checking recursive call");
            match stack2.get(np) {
                None => Err(GuardError::PartialApply {
                    fix: self.names[glob].clone(),
                }),
                Some(elem) => {
                    let spec = stack_element_specif(self.env, self.fuel, elem)?;
                    if check_is_subterm(&spec, &self.trees[glob]) {
                        Ok(())
                    } else {
                        match elem {
                            StackElem::Closure(_, arg) => Err(GuardError::IllegalRecCall {
                                fix: self.names[glob].clone(),
                                arg: arg.clone(),
                            }),
                            StackElem::Arg(_) => Err(GuardError::NotEnoughInfo {
                                fix: self.names[glob].clone(),
                            }),
                        }
                    }
                }
            }
        } else {
            l.iter().try_for_each(|a| self.check_rec_call(renv, &[], a))
        }
    }

    /// Enter a nested fixpoint body: `decr` lambdas are bound as
    /// non-recursive, then the decreasing one is re-bound with `spec`.
    fn check_nested_fix_body(
        &self,
        renv: GuardEnv,
        decr: usize,
        spec: SubtermSpec,
        body: &Rc<Term>,
    ) -> Result<(), GuardError> {
        if decr == 0 {
            let mut renv2 = renv;
            renv2.assign_spec(0, spec)?;
            return self.check_rec_call(&renv2, &[], body);
        }
        let b = reduce::whd_all(self.env, &renv.ctx, body, self.fuel)?;
        match &*b {
            Term::Lambda(a, b2) => {
                self.check_rec_call(&renv, &[], a)?;
                self.check_nested_fix_body(renv.push_var_norec(a), decr - 1, spec, b2)
            }
            _ => Err(GuardError::Internal(
                "not enough abstractions in a nested fixpoint body",
            )),
        }
    }
}

// =============================================================================
// Entry points
// =============================================================================

fn push_rec_types_ctx(ctx: &Context, defs: &RecDef) -> Context {
    let mut c = ctx.clone();
    for (i, ty) in defs.types.iter().enumerate() {
        c = c.push_assum(ty.shift(0, i));
    }
    c
}

/// For each body, the inductive type it recurses on, and the context/body
/// pair obtained by entering the abstractions up to the decreasing
/// argument.
#[allow(clippy::type_complexity)]
fn inductive_of_mutfix(
    env: &Env,
    ctx: &Context,
    rec_args: &[usize],
    defs: &RecDef,
    fuel: &Fuel,
) -> Result<(Vec<IndRef>, Vec<(Context, Rc<Term>)>), GuardError> {
    let nbfix = defs.bodies.len();
    if nbfix == 0
        || defs.types.len() != nbfix
        || defs.names.len() != nbfix
        || rec_args.len() != nbfix
    {
        return Err(GuardError::Internal("ill-formed fixpoint block"));
    }
    let fixenv = push_rec_types_ctx(ctx, defs);
    let mut inds = Vec::with_capacity(nbfix);
    let mut rdefs = Vec::with_capacity(nbfix);
    for i in 0..nbfix {
        let k = rec_args[i];
        let mut cenv = fixenv.clone();
        let mut d = defs.bodies[i].clone();
        for n in 0..=k {
            let dr = reduce::whd_all(env, &cenv, &d, fuel)?;
            let Term::Lambda(a, b) = &*dr else {
                return Err(GuardError::NotEnoughAbstractions {
                    fix: defs.names[i].clone(),
                });
            };
            // the types of the leading arguments may not call the block
            if !a.noccur_with_evars(n, nbfix) {
                return Err(GuardError::Internal(
                    "recursive occurrence in a leading argument type of a fixpoint",
                ));
            }
            if n == k {
                let Some((ind, _)) = find_rectype(env, &cenv, a, fuel)? else {
                    return Err(GuardError::RecursionNotOnInductiveType {
                        fix: defs.names[i].clone(),
                        ty: a.clone(),
                    });
                };
                let (mib, _) = env.lookup_mind_specif(&ind)?;
                if mib.finite != Finiteness::Finite {
                    return Err(GuardError::RecursionOnNonFinite {
                        fix: defs.names[i].clone(),
                        ind,
                    });
                }
                inds.push(ind);
                rdefs.push((cenv.push_assum(a.clone()), b.clone()));
                break;
            }
            cenv = cenv.push_assum(a.clone());
            d = b.clone();
        }
    }
    Ok((inds, rdefs))
}

/// Check that every recursive call of a mutual fixpoint is guarded, with
/// the default step budget. `fix` must be a [`Term::Fix`]; all bodies of
/// the block are verified.
pub fn check_fix(env: &Env, ctx: &Context, fix: &Term) -> Result<(), GuardError> {
    check_fix_with_fuel(env, ctx, fix, reduce::DEFAULT_FUEL)
}

/// [`check_fix`] under an explicit step budget.
pub fn check_fix_with_fuel(
    env: &Env,
    ctx: &Context,
    fix: &Term,
    fuel_units: u64,
) -> Result<(), GuardError> {
    let Term::Fix(rec_args, _, defs) = fix else {
        return Err(GuardError::Internal("check_fix expects a fixpoint term"));
    };
    let fuel = Fuel::new(fuel_units);
    let (inds, rdefs) = inductive_of_mutfix(env, ctx, rec_args, defs, &fuel)?;
    let mut trees = Vec::with_capacity(inds.len());
    for ind in &inds {
        let (_, oib) = env.lookup_mind_specif(ind)?;
        trees.push(oib.recargs.clone());
    }
    let checker = FixChecker {
        env,
        fuel: &fuel,
        rec_args,
        trees: &trees,
        names: &defs.names,
    };
    for (i, (cenv, body)) in rdefs.iter().enumerate() {
        trace!(fix = %defs.names[i], "checking fixpoint body");
        let renv = GuardEnv::new(
            cenv.clone(),
            rec_args[i] + 1,
            SubtermSpec::Subterm(Size::Loose, trees[i].clone()),
        );
        checker.check_rec_call(&renv, &[], body)?;
    }
    Ok(())
}
