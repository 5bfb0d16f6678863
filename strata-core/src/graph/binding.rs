//! User-Function Binding
//!
//! Node bodies are plain Rust closures over references to product types:
//! `|hits: &Vec<Hit>, geo: &Geometry| -> Tracks`. The traits here are
//! implemented for every such closure up to four arguments, and the
//! `box_*` adapters erase them into uniform boxed signatures over
//! [`ResolvedInputs`] so the node machinery never sees the concrete
//! types. Extraction failures (missing product, wrong type) surface as
//! [`RuntimeError`] rather than panics.

use std::any::Any;
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::model::{CellIndex, ProductMap, ProductStore, TypeTag};

/// One resolved store per input port, paired with the product name each
/// port asked for. Argument `i` of the user function is extracted from
/// `stores[i]` under `names[i]`.
pub struct ResolvedInputs<'a> {
    names: &'a [String],
    stores: &'a [Arc<ProductStore>],
}

impl<'a> ResolvedInputs<'a> {
    pub(crate) fn new(names: &'a [String], stores: &'a [Arc<ProductStore>]) -> Self {
        debug_assert_eq!(names.len(), stores.len());
        Self { names, stores }
    }

    /// Extract argument `i` as a typed reference.
    pub fn get<T: Send + Sync + 'static>(&self, i: usize) -> Result<&T, RuntimeError> {
        self.stores[i].get::<T>(&self.names[i])
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

/// Closure usable as a transform body: borrows its arguments, returns the
/// output product by value.
pub trait TransformFn<Args>: Send + Sync + 'static {
    type Output: Send + Sync + 'static;
    const ARITY: usize;
    fn input_tags() -> Vec<TypeTag>;
    fn output_tag() -> TypeTag {
        TypeTag::of::<Self::Output>()
    }
    fn call(&self, inputs: &ResolvedInputs) -> Result<Self::Output, RuntimeError>;
}

/// Closure usable as a predicate body.
pub trait PredicateFn<Args>: Send + Sync + 'static {
    const ARITY: usize;
    fn input_tags() -> Vec<TypeTag>;
    fn call(&self, inputs: &ResolvedInputs) -> Result<bool, RuntimeError>;
}

/// Closure usable as an observer body.
pub trait ObserverFn<Args>: Send + Sync + 'static {
    const ARITY: usize;
    fn input_tags() -> Vec<TypeTag>;
    fn call(&self, inputs: &ResolvedInputs) -> Result<(), RuntimeError>;
}

/// Closure usable as a fold step: mutates the partition accumulator in
/// place for each fine-grained contribution.
pub trait FoldFn<Acc, Args>: Send + Sync + 'static {
    const ARITY: usize;
    fn input_tags() -> Vec<TypeTag>;
    fn call(&self, acc: &mut Acc, inputs: &ResolvedInputs) -> Result<(), RuntimeError>;
}

/// Closure usable as an unfold initializer: builds the generator state
/// from the trigger's inputs.
pub trait UnfoldInitFn<Args, State>: Send + Sync + 'static {
    const ARITY: usize;
    fn input_tags() -> Vec<TypeTag>;
    fn call(&self, inputs: &ResolvedInputs) -> Result<State, RuntimeError>;
}

macro_rules! impl_fn_traits {
    ($n:expr; $($arg:ident => $idx:tt),+) => {
        impl<F, R, $($arg),+> TransformFn<($($arg,)+)> for F
        where
            F: Fn($(&$arg),+) -> R + Send + Sync + 'static,
            R: Send + Sync + 'static,
            $($arg: Send + Sync + 'static,)+
        {
            type Output = R;
            const ARITY: usize = $n;
            fn input_tags() -> Vec<TypeTag> {
                vec![$(TypeTag::of::<$arg>()),+]
            }
            fn call(&self, inputs: &ResolvedInputs) -> Result<R, RuntimeError> {
                Ok((self)($(inputs.get::<$arg>($idx)?),+))
            }
        }

        impl<F, $($arg),+> PredicateFn<($($arg,)+)> for F
        where
            F: Fn($(&$arg),+) -> bool + Send + Sync + 'static,
            $($arg: Send + Sync + 'static,)+
        {
            const ARITY: usize = $n;
            fn input_tags() -> Vec<TypeTag> {
                vec![$(TypeTag::of::<$arg>()),+]
            }
            fn call(&self, inputs: &ResolvedInputs) -> Result<bool, RuntimeError> {
                Ok((self)($(inputs.get::<$arg>($idx)?),+))
            }
        }

        impl<F, $($arg),+> ObserverFn<($($arg,)+)> for F
        where
            F: Fn($(&$arg),+) + Send + Sync + 'static,
            $($arg: Send + Sync + 'static,)+
        {
            const ARITY: usize = $n;
            fn input_tags() -> Vec<TypeTag> {
                vec![$(TypeTag::of::<$arg>()),+]
            }
            fn call(&self, inputs: &ResolvedInputs) -> Result<(), RuntimeError> {
                (self)($(inputs.get::<$arg>($idx)?),+);
                Ok(())
            }
        }

        impl<F, Acc, $($arg),+> FoldFn<Acc, ($($arg,)+)> for F
        where
            F: Fn(&mut Acc, $(&$arg),+) + Send + Sync + 'static,
            Acc: Send + 'static,
            $($arg: Send + Sync + 'static,)+
        {
            const ARITY: usize = $n;
            fn input_tags() -> Vec<TypeTag> {
                vec![$(TypeTag::of::<$arg>()),+]
            }
            fn call(&self, acc: &mut Acc, inputs: &ResolvedInputs) -> Result<(), RuntimeError> {
                (self)(acc, $(inputs.get::<$arg>($idx)?),+);
                Ok(())
            }
        }

        impl<F, S, $($arg),+> UnfoldInitFn<($($arg,)+), S> for F
        where
            F: Fn($(&$arg),+) -> S + Send + Sync + 'static,
            S: Send + 'static,
            $($arg: Send + Sync + 'static,)+
        {
            const ARITY: usize = $n;
            fn input_tags() -> Vec<TypeTag> {
                vec![$(TypeTag::of::<$arg>()),+]
            }
            fn call(&self, inputs: &ResolvedInputs) -> Result<S, RuntimeError> {
                Ok((self)($(inputs.get::<$arg>($idx)?),+))
            }
        }
    };
}

impl_fn_traits!(1; A => 0);
impl_fn_traits!(2; A => 0, B => 1);
impl_fn_traits!(3; A => 0, B => 1, C => 2);
impl_fn_traits!(4; A => 0, B => 1, C => 2, D => 3);

pub(crate) type BoxedTransform =
    Box<dyn Fn(&ResolvedInputs) -> Result<ProductMap, RuntimeError> + Send + Sync>;
pub(crate) type BoxedPredicate =
    Box<dyn Fn(&ResolvedInputs) -> Result<bool, RuntimeError> + Send + Sync>;
pub(crate) type BoxedObserver =
    Box<dyn Fn(&ResolvedInputs) -> Result<(), RuntimeError> + Send + Sync>;
pub(crate) type BoxedProvider = Box<dyn Fn(&CellIndex) -> ProductMap + Send + Sync>;
pub(crate) type BoxedUnfold = Box<
    dyn Fn(&ResolvedInputs, &mut dyn FnMut(ProductMap)) -> Result<usize, RuntimeError>
        + Send
        + Sync,
>;

/// Type-erased accumulator plumbing for a fold node.
pub(crate) struct FoldOps {
    pub init: Box<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>,
    pub step:
        Box<dyn Fn(&mut (dyn Any + Send), &ResolvedInputs) -> Result<(), RuntimeError> + Send + Sync>,
    pub publish: Box<dyn Fn(Box<dyn Any + Send>) -> ProductMap + Send + Sync>,
}

pub(crate) fn box_transform<Args, F>(f: F, output: String) -> BoxedTransform
where
    F: TransformFn<Args>,
    Args: 'static,
{
    Box::new(move |inputs| {
        let value = f.call(inputs)?;
        let mut products = ProductMap::new();
        products.insert(output.clone(), value);
        Ok(products)
    })
}

pub(crate) fn box_predicate<Args, F>(f: F) -> BoxedPredicate
where
    F: PredicateFn<Args>,
    Args: 'static,
{
    Box::new(move |inputs| f.call(inputs))
}

pub(crate) fn box_observer<Args, F>(f: F) -> BoxedObserver
where
    F: ObserverFn<Args>,
    Args: 'static,
{
    Box::new(move |inputs| f.call(inputs))
}

pub(crate) fn box_fold<Acc, Args, F>(init: Acc, f: F, output: String) -> FoldOps
where
    Acc: Clone + Send + Sync + 'static,
    F: FoldFn<Acc, Args>,
    Args: 'static,
{
    FoldOps {
        init: Box::new(move || Box::new(init.clone())),
        step: Box::new(move |acc, inputs| {
            let acc = acc
                .downcast_mut::<Acc>()
                .expect("fold accumulator type is fixed at registration");
            f.call(acc, inputs)
        }),
        publish: Box::new(move |acc| {
            let acc = acc
                .downcast::<Acc>()
                .expect("fold accumulator type is fixed at registration");
            let mut products = ProductMap::new();
            products.insert(output.clone(), *acc);
            products
        }),
    }
}

pub(crate) fn box_provider<R, F>(f: F, output: String) -> BoxedProvider
where
    R: Send + Sync + 'static,
    F: Fn(&CellIndex) -> R + Send + Sync + 'static,
{
    Box::new(move |index| {
        let mut products = ProductMap::new();
        products.insert(output.clone(), f(index));
        products
    })
}

/// Compose init/continue/generate closures into the uniform unfold
/// driver: initialize state from the trigger, then emit one child's
/// products per generator call while the continuation predicate holds.
/// Returns the child count.
pub(crate) fn box_unfold<Args, S, I, P, G>(init: I, keep_going: P, generate: G) -> BoxedUnfold
where
    I: UnfoldInitFn<Args, S>,
    P: Fn(&S) -> bool + Send + Sync + 'static,
    G: Fn(&mut S) -> ProductMap + Send + Sync + 'static,
    S: Send + 'static,
    Args: 'static,
{
    Box::new(move |inputs, emit| {
        let mut state = init.call(inputs)?;
        let mut count = 0usize;
        while keep_going(&state) {
            emit(generate(&mut state));
            count += 1;
        }
        Ok(count)
    })
}
