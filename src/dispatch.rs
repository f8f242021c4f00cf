//! Compile-time dispatch over heterogeneous bundles of components.
//!
//! A bundle is a tuple of [`Component`] types. [`Bundle`] is implemented for
//! `()` and for tuples of up to twelve components; each method unrolls into
//! one call per element in declaration order, so there is no dynamic
//! dispatch, no allocation, and no runtime type tag. Operations are visitor
//! values with a generic method: extra arguments travel as fields of the
//! visitor, results are read back out of it afterwards.
//!
//! [`Select`] resolves the position of a single type within a bundle at
//! compile time. That powers [`out_of_order`], which applies an operation to
//! one named component in a bundle whose layout the caller does not know.

use std::fmt;
use std::fmt::Write as _;
use std::marker::PhantomData;

use serde::Serialize;

use crate::component::{BackendFailures, Category, Component};

/// Per-element mutable operation.
pub trait Operation {
    fn apply<C: Component>(&mut self, index: usize, component: &mut C);
}

/// Per-element read-only operation.
pub trait Inspect {
    fn inspect<C: Component>(&mut self, index: usize, component: &C);
}

/// Element-wise operation over two bundles of the same composition.
pub trait BinaryOperation {
    fn apply<C: Component>(&mut self, index: usize, lhs: &mut C, rhs: &C);
}

/// Per-type operation that needs no instance.
pub trait TypeVisitor {
    fn visit<C: Component>(&mut self, index: usize);
}

/// A fixed, ordered list of component types stored together.
pub trait Bundle: Default + Clone + fmt::Debug + Serialize + Send + 'static {
    const ARITY: usize;

    fn access<O: Operation>(&mut self, op: &mut O);

    fn inspect<I: Inspect>(&self, visitor: &mut I);

    fn access2<O: BinaryOperation>(&mut self, rhs: &Self, op: &mut O);

    fn visit_types<V: TypeVisitor>(visitor: &mut V);
}

/// Type-level position marker used by [`Select`].
pub struct Idx<const N: usize>;

/// Compile-time lookup of the element of type `T` in a bundle.
///
/// `I` is always inferred. A bundle without a `T` has no impl, and a bundle
/// with two `T`s has two impls that inference cannot choose between, so both
/// mistakes are rejected by the compiler.
pub trait Select<T, I> {
    const INDEX: usize;

    fn select(&self) -> &T;

    fn select_mut(&mut self) -> &mut T;
}

impl Bundle for () {
    const ARITY: usize = 0;

    fn access<O: Operation>(&mut self, _op: &mut O) {}

    fn inspect<I: Inspect>(&self, _visitor: &mut I) {}

    fn access2<O: BinaryOperation>(&mut self, _rhs: &Self, _op: &mut O) {}

    fn visit_types<V: TypeVisitor>(_visitor: &mut V) {}
}

macro_rules! impl_select {
    ($gens:tt; $($T:ident . $idx:tt),+) => {
        $( impl_select!(@one $gens $T $idx); )+
    };
    (@one [$($G:ident),+] $T:ident $idx:tt) => {
        impl<$($G: Component),+> Select<$T, Idx<$idx>> for ($($G,)+) {
            const INDEX: usize = $idx;

            #[inline]
            fn select(&self) -> &$T {
                &self.$idx
            }

            #[inline]
            fn select_mut(&mut self) -> &mut $T {
                &mut self.$idx
            }
        }
    };
}

macro_rules! impl_bundle {
    ($arity:expr; $($T:ident . $idx:tt),+) => {
        impl<$($T: Component),+> Bundle for ($($T,)+) {
            const ARITY: usize = $arity;

            #[inline]
            fn access<O: Operation>(&mut self, op: &mut O) {
                $( op.apply($idx, &mut self.$idx); )+
            }

            #[inline]
            fn inspect<I: Inspect>(&self, visitor: &mut I) {
                $( visitor.inspect($idx, &self.$idx); )+
            }

            #[inline]
            fn access2<O: BinaryOperation>(&mut self, rhs: &Self, op: &mut O) {
                $( op.apply($idx, &mut self.$idx, &rhs.$idx); )+
            }

            #[inline]
            fn visit_types<V: TypeVisitor>(visitor: &mut V) {
                $( visitor.visit::<$T>($idx); )+
            }
        }

        impl_select!([$($T),+]; $($T . $idx),+);
    };
}

impl_bundle!(1; A.0);
impl_bundle!(2; A.0, B.1);
impl_bundle!(3; A.0, B.1, C.2);
impl_bundle!(4; A.0, B.1, C.2, D.3);
impl_bundle!(5; A.0, B.1, C.2, D.3, E.4);
impl_bundle!(6; A.0, B.1, C.2, D.3, E.4, F.5);
impl_bundle!(7; A.0, B.1, C.2, D.3, E.4, F.5, G.6);
impl_bundle!(8; A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7);
impl_bundle!(9; A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7, J.8);
impl_bundle!(10; A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7, J.8, K.9);
impl_bundle!(11; A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7, J.8, K.9, L.10);
impl_bundle!(12; A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7, J.8, K.9, L.10, M.11);

// ---------------------------------------------------------------------------
// Type predicates
// ---------------------------------------------------------------------------

/// Compile-time predicate over component types.
pub trait TypePredicate {
    fn matches<C: Component>() -> bool;
}

macro_rules! category_predicate {
    ($($name:ident => $cat:ident),+ $(,)?) => {
        $(
            #[doc = concat!("Matches components whose category is `", stringify!($cat), "`.")]
            pub struct $name;

            impl TypePredicate for $name {
                #[inline]
                fn matches<C: Component>() -> bool {
                    matches!(C::CATEGORY, Category::$cat)
                }
            }
        )+
    };
}

category_predicate!(
    IsTiming => Timing,
    IsCounter => Counter,
    IsMemory => Memory,
    IsEnergy => Energy,
);

/// Inverts a predicate.
pub struct Not<P>(PhantomData<P>);

impl<P: TypePredicate> TypePredicate for Not<P> {
    #[inline]
    fn matches<C: Component>() -> bool {
        !P::matches::<C>()
    }
}

/// Restricts a visitor to the elements whose type satisfies `P`.
///
/// The predicate only reads associated constants, so each monomorphized
/// branch folds away.
pub struct Filtered<P, V> {
    inner: V,
    _pred: PhantomData<P>,
}

impl<P, V> Filtered<P, V> {
    pub fn new(inner: V) -> Self {
        Self {
            inner,
            _pred: PhantomData,
        }
    }

    pub fn into_inner(self) -> V {
        self.inner
    }
}

impl<P: TypePredicate, V: Operation> Operation for Filtered<P, V> {
    fn apply<C: Component>(&mut self, index: usize, component: &mut C) {
        if P::matches::<C>() {
            self.inner.apply(index, component);
        }
    }
}

impl<P: TypePredicate, V: Inspect> Inspect for Filtered<P, V> {
    fn inspect<C: Component>(&mut self, index: usize, component: &C) {
        if P::matches::<C>() {
            self.inner.inspect(index, component);
        }
    }
}

impl<P: TypePredicate, V: BinaryOperation> BinaryOperation for Filtered<P, V> {
    fn apply<C: Component>(&mut self, index: usize, lhs: &mut C, rhs: &C) {
        if P::matches::<C>() {
            self.inner.apply(index, lhs, rhs);
        }
    }
}

impl<P: TypePredicate, V: TypeVisitor> TypeVisitor for Filtered<P, V> {
    fn visit<C: Component>(&mut self, index: usize) {
        if P::matches::<C>() {
            self.inner.visit::<C>(index);
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in operations
// ---------------------------------------------------------------------------

/// Starts every element, collecting failures instead of stopping at the first.
#[derive(Debug, Default)]
pub struct Start {
    pub failures: BackendFailures,
}

impl Operation for Start {
    fn apply<C: Component>(&mut self, _index: usize, component: &mut C) {
        if let Err(err) = component.start() {
            self.failures.push(err);
        }
    }
}

/// Stops every element, collecting failures instead of stopping at the first.
#[derive(Debug, Default)]
pub struct Stop {
    pub failures: BackendFailures,
}

impl Operation for Stop {
    fn apply<C: Component>(&mut self, _index: usize, component: &mut C) {
        if let Err(err) = component.stop() {
            self.failures.push(err);
        }
    }
}

/// `lhs += rhs` per element.
pub struct Plus;

impl BinaryOperation for Plus {
    #[inline]
    fn apply<C: Component>(&mut self, _index: usize, lhs: &mut C, rhs: &C) {
        *lhs += rhs;
    }
}

/// `lhs -= rhs` per element.
pub struct Minus;

impl BinaryOperation for Minus {
    #[inline]
    fn apply<C: Component>(&mut self, _index: usize, lhs: &mut C, rhs: &C) {
        *lhs -= rhs;
    }
}

/// Replaces `lhs` with its percent difference against `rhs`.
///
/// Components without a numeric interpretation are reset to their zero state.
pub struct PercentDiff;

impl BinaryOperation for PercentDiff {
    fn apply<C: Component>(&mut self, _index: usize, lhs: &mut C, rhs: &C) {
        *lhs = lhs.percent_diff(rhs).unwrap_or_default();
    }
}

/// Overwrites every numeric element with the same scalar.
pub struct SetValue(pub f64);

impl Operation for SetValue {
    fn apply<C: Component>(&mut self, _index: usize, component: &mut C) {
        component.set_value(self.0);
    }
}

/// Concatenates the display form of each element.
pub struct Join<'a> {
    separator: &'a str,
    out: String,
    any: bool,
}

impl<'a> Join<'a> {
    pub fn new(separator: &'a str) -> Self {
        Self {
            separator,
            out: String::new(),
            any: false,
        }
    }

    pub fn finish(self) -> String {
        self.out
    }
}

impl Inspect for Join<'_> {
    fn inspect<C: Component>(&mut self, _index: usize, component: &C) {
        if self.any {
            self.out.push_str(self.separator);
        }
        self.any = true;
        let _ = write!(self.out, "{component}");
    }
}

/// Collects `C::LABEL` for each element type.
#[derive(Debug, Default)]
pub struct Labels(pub Vec<&'static str>);

impl TypeVisitor for Labels {
    fn visit<C: Component>(&mut self, _index: usize) {
        self.0.push(C::LABEL);
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Call `visitor` once per element, in declaration order, without mutation.
pub fn invoke<B: Bundle, I: Inspect>(bundle: &B, visitor: &mut I) {
    bundle.inspect(visitor);
}

/// Apply `op` to every element, in declaration order.
pub fn access<B: Bundle, O: Operation>(bundle: &mut B, op: &mut O) {
    bundle.access(op);
}

/// Apply `op` to corresponding elements of two bundles.
pub fn access2<B: Bundle, O: BinaryOperation>(lhs: &mut B, rhs: &B, op: &mut O) {
    lhs.access2(rhs, op);
}

/// Apply `op` to the single element of type `T`, leaving the others alone.
///
/// ```
/// use stackgraph::component::Laps;
/// use stackgraph::dispatch::{out_of_order, SetValue};
///
/// let mut bundle = (Laps::default(),);
/// out_of_order::<Laps, _, _, _>(&mut bundle, &mut SetValue(3.0));
/// assert_eq!(bundle.0.count(), 3);
/// ```
///
/// A bundle holding the type twice is ambiguous and does not compile:
///
/// ```compile_fail
/// use stackgraph::component::Laps;
/// use stackgraph::dispatch::{out_of_order, SetValue};
///
/// let mut bundle = (Laps::default(), Laps::default());
/// out_of_order::<Laps, _, _, _>(&mut bundle, &mut SetValue(3.0));
/// ```
///
/// Neither does a bundle without it:
///
/// ```compile_fail
/// use stackgraph::component::Laps;
/// use stackgraph::dispatch::{out_of_order, SetValue};
///
/// let mut bundle = ();
/// out_of_order::<Laps, _, _, _>(&mut bundle, &mut SetValue(3.0));
/// ```
pub fn out_of_order<T, I, B, O>(bundle: &mut B, op: &mut O)
where
    T: Component,
    B: Select<T, I>,
    O: Operation,
{
    op.apply(B::INDEX, bundle.select_mut());
}

/// Pair the element of type `T` in `lhs` with the one in `rhs`.
///
/// The two bundles may have different compositions; `T` only needs to appear
/// exactly once in each.
pub fn out_of_order2<T, I, J, A, U, O>(lhs: &mut A, rhs: &U, op: &mut O)
where
    T: Component,
    A: Select<T, I>,
    U: Select<T, J>,
    O: BinaryOperation,
{
    op.apply(A::INDEX, lhs.select_mut(), rhs.select());
}

/// Position of `T` within `B`, resolved at compile time.
pub fn index_of<T, I, B: Select<T, I>>() -> usize {
    B::INDEX
}

/// Start every element. All elements are attempted even if some fail.
pub fn start<B: Bundle>(bundle: &mut B) -> Result<(), BackendFailures> {
    let mut op = Start::default();
    bundle.access(&mut op);
    op.failures.into_result()
}

/// Stop every element. All elements are attempted even if some fail.
pub fn stop<B: Bundle>(bundle: &mut B) -> Result<(), BackendFailures> {
    let mut op = Stop::default();
    bundle.access(&mut op);
    op.failures.into_result()
}

pub fn plus<B: Bundle>(lhs: &mut B, rhs: &B) {
    lhs.access2(rhs, &mut Plus);
}

pub fn minus<B: Bundle>(lhs: &mut B, rhs: &B) {
    lhs.access2(rhs, &mut Minus);
}

/// Element-wise percent difference of `lhs` relative to `rhs`.
pub fn percent_diff<B: Bundle>(lhs: &B, rhs: &B) -> B {
    let mut ret = lhs.clone();
    ret.access2(rhs, &mut PercentDiff);
    ret
}

pub fn set_value<B: Bundle>(bundle: &mut B, value: f64) {
    bundle.access(&mut SetValue(value));
}

/// Display every element, separated by `separator`.
pub fn join<B: Bundle>(bundle: &B, separator: &str) -> String {
    let mut visitor = Join::new(separator);
    bundle.inspect(&mut visitor);
    visitor.finish()
}

/// Labels of the bundle's component types, in declaration order.
pub fn labels<B: Bundle>() -> Vec<&'static str> {
    let mut visitor = Labels(Vec::with_capacity(B::ARITY));
    B::visit_types(&mut visitor);
    visitor.0
}
