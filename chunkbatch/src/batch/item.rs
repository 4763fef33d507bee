//! Item contracts: readers, processors and writers.
//!
//! The chunk engine only talks to its input and output through these traits.
//! All three return boxed futures so that they stay object-safe; composite
//! adapters keep `Arc<dyn ItemProcessor<..>>` dispatch tables.
//!
//! # Contracts
//!
//! - [`ItemReader::read`] returns `Ok(None)` at end of input. The engine
//!   caches items it has read, so readers are never asked to re-read for a
//!   retry.
//! - [`ItemProcessor::process`] returns `Ok(None)` to filter an item.
//! - [`ItemWriter::write`] receives one chunk and must treat it as a unit.
//!
//! Readers and writers also take part in the stream lifecycle (`open`,
//! `update`, `close`) so that they can save their position into the step's
//! [`ExecutionContext`] at each commit and resume from it on restart.
//!
//! # Example
//!
//! ```ignore
//! use chunkbatch::batch::item::{FnItemProcessor, ListItemReader, ListItemWriter};
//!
//! let reader = ListItemReader::new((1..=10).collect::<Vec<i32>>());
//! let processor = FnItemProcessor::new(|n: &i32| Ok(Some(n * 2)));
//! let writer = ListItemWriter::new();
//! ```

use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use super::context::ExecutionContext;
use super::error::ItemError;

// =============================================================================
// Contracts
// =============================================================================

/// Source of items, pulled one at a time.
pub trait ItemReader: Send {
    type Item: Send + Sync + 'static;

    /// Reads the next item, or `None` once input is exhausted.
    fn read(&mut self) -> BoxFuture<'_, Result<Option<Self::Item>, ItemError>>;

    /// Called before the first read with the step's (possibly restored) context.
    fn open(&mut self, _ctx: &ExecutionContext) -> Result<(), ItemError> {
        Ok(())
    }

    /// Called at each chunk commit to save the reader's position.
    fn update(&mut self, _ctx: &mut ExecutionContext) -> Result<(), ItemError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), ItemError> {
        Ok(())
    }
}

/// Transforms one item. Returning `Ok(None)` filters the item out.
pub trait ItemProcessor: Send + Sync {
    type Input: Send + Sync + 'static;
    type Output: Send + Sync + 'static;

    fn process<'a>(
        &'a self,
        item: &'a Self::Input,
    ) -> BoxFuture<'a, Result<Option<Self::Output>, ItemError>>;
}

/// Sink for a chunk of items.
///
/// Writers are shared by reference so that a multi-threaded step can call
/// them from several workers at once.
pub trait ItemWriter: Send + Sync {
    type Item: Send + Sync + 'static;

    fn write<'a>(&'a self, items: &'a [Self::Item]) -> BoxFuture<'a, Result<(), ItemError>>;

    fn open(&self, _ctx: &ExecutionContext) -> Result<(), ItemError> {
        Ok(())
    }

    fn update(&self, _ctx: &mut ExecutionContext) -> Result<(), ItemError> {
        Ok(())
    }

    fn close(&self) -> Result<(), ItemError> {
        Ok(())
    }
}

// =============================================================================
// Readers
// =============================================================================

/// Reads from an in-memory list and saves its position for restart.
pub struct ListItemReader<T> {
    name: String,
    items: VecDeque<T>,
    read_count: u64,
}

impl<T> ListItemReader<T> {
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            name: "list_reader".to_string(),
            items: items.into_iter().collect(),
            read_count: 0,
        }
    }

    /// Sets the prefix of the context key the position is saved under.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn position_key(&self) -> String {
        format!("{}.read.count", self.name)
    }
}

impl<T: Send + Sync + 'static> ItemReader for ListItemReader<T> {
    type Item = T;

    fn read(&mut self) -> BoxFuture<'_, Result<Option<T>, ItemError>> {
        let item = self.items.pop_front();
        if item.is_some() {
            self.read_count += 1;
        }
        Box::pin(future::ready(Ok(item)))
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError> {
        if let Some(saved) = ctx.get_i64(&self.position_key()) {
            let saved = u64::try_from(saved).unwrap_or(0);
            while self.read_count < saved {
                if self.items.pop_front().is_none() {
                    break;
                }
                self.read_count += 1;
            }
        }
        Ok(())
    }

    fn update(&mut self, ctx: &mut ExecutionContext) -> Result<(), ItemError> {
        ctx.put(self.position_key(), self.read_count);
        Ok(())
    }
}

/// Adapts any iterator into a reader.
pub struct IteratorItemReader<I> {
    iter: I,
}

impl<I> IteratorItemReader<I> {
    pub fn new(iter: I) -> Self {
        Self { iter }
    }
}

impl<I> ItemReader for IteratorItemReader<I>
where
    I: Iterator + Send,
    I::Item: Send + Sync + 'static,
{
    type Item = I::Item;

    fn read(&mut self) -> BoxFuture<'_, Result<Option<I::Item>, ItemError>> {
        Box::pin(future::ready(Ok(self.iter.next())))
    }
}

/// Reader backed by a closure.
pub struct FnItemReader<F, T> {
    f: F,
    _item: PhantomData<fn() -> T>,
}

impl<F, T> FnItemReader<F, T>
where
    F: FnMut() -> Result<Option<T>, ItemError> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _item: PhantomData,
        }
    }
}

impl<F, T> ItemReader for FnItemReader<F, T>
where
    F: FnMut() -> Result<Option<T>, ItemError> + Send,
    T: Send + Sync + 'static,
{
    type Item = T;

    fn read(&mut self) -> BoxFuture<'_, Result<Option<T>, ItemError>> {
        Box::pin(future::ready((self.f)()))
    }
}

/// Serialises `read` calls on a reader shared by several workers.
///
/// Cloning the adapter yields another handle to the same underlying reader,
/// so every `read` across all handles returns a distinct item exactly once.
/// Process and write stay concurrent.
pub struct SynchronizedItemReader<R> {
    inner: Arc<tokio::sync::Mutex<R>>,
}

impl<R> SynchronizedItemReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(reader)),
        }
    }
}

impl<R> Clone for SynchronizedItemReader<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: ItemReader> ItemReader for SynchronizedItemReader<R> {
    type Item = R::Item;

    fn read(&mut self) -> BoxFuture<'_, Result<Option<R::Item>, ItemError>> {
        Box::pin(async move {
            let mut reader = self.inner.lock().await;
            let item = reader.read().await;
            item
        })
    }

    fn open(&mut self, ctx: &ExecutionContext) -> Result<(), ItemError> {
        let mut reader = self
            .inner
            .try_lock()
            .map_err(|_| ItemError::new("reader.busy", "synchronized reader in use during open"))?;
        reader.open(ctx)
    }

    fn update(&mut self, ctx: &mut ExecutionContext) -> Result<(), ItemError> {
        // Best effort: another worker may hold the lock mid-read.
        match self.inner.try_lock() {
            Ok(mut reader) => reader.update(ctx),
            Err(_) => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), ItemError> {
        match self.inner.try_lock() {
            Ok(mut reader) => reader.close(),
            Err(_) => Ok(()),
        }
    }
}

// =============================================================================
// Processors
// =============================================================================

/// Returns every item unchanged.
pub struct PassThroughItemProcessor<T> {
    _item: PhantomData<fn() -> T>,
}

impl<T> PassThroughItemProcessor<T> {
    pub fn new() -> Self {
        Self { _item: PhantomData }
    }
}

impl<T> Default for PassThroughItemProcessor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> ItemProcessor for PassThroughItemProcessor<T> {
    type Input = T;
    type Output = T;

    fn process<'a>(&'a self, item: &'a T) -> BoxFuture<'a, Result<Option<T>, ItemError>> {
        Box::pin(future::ready(Ok(Some(item.clone()))))
    }
}

/// Processor backed by a synchronous closure.
pub struct FnItemProcessor<F, I, O> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

impl<F, I, O> FnItemProcessor<F, I, O>
where
    F: Fn(&I) -> Result<Option<O>, ItemError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _types: PhantomData,
        }
    }
}

impl<F, I, O> ItemProcessor for FnItemProcessor<F, I, O>
where
    F: Fn(&I) -> Result<Option<O>, ItemError> + Send + Sync,
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    type Input = I;
    type Output = O;

    fn process<'a>(&'a self, item: &'a I) -> BoxFuture<'a, Result<Option<O>, ItemError>> {
        Box::pin(future::ready((self.f)(item)))
    }
}

/// Chains two processors; a filter from the first short-circuits the second.
pub struct CompositeItemProcessor<A, B> {
    first: A,
    second: B,
}

impl<A, B> CompositeItemProcessor<A, B>
where
    A: ItemProcessor,
    B: ItemProcessor<Input = A::Output>,
{
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }

    /// Appends another processor to the chain.
    pub fn then<C>(self, next: C) -> CompositeItemProcessor<Self, C>
    where
        C: ItemProcessor<Input = B::Output>,
    {
        CompositeItemProcessor::new(self, next)
    }
}

impl<A, B> ItemProcessor for CompositeItemProcessor<A, B>
where
    A: ItemProcessor,
    B: ItemProcessor<Input = A::Output>,
{
    type Input = A::Input;
    type Output = B::Output;

    fn process<'a>(
        &'a self,
        item: &'a A::Input,
    ) -> BoxFuture<'a, Result<Option<B::Output>, ItemError>> {
        Box::pin(async move {
            let Some(intermediate) = self.first.process(item).await? else {
                return Ok(None);
            };
            let output = self.second.process(&intermediate).await;
            output
        })
    }
}

/// Shared processor trait object used in dispatch tables.
pub type DynItemProcessor<I, O> = Arc<dyn ItemProcessor<Input = I, Output = O>>;

/// Routes each item to a processor selected by a classification key.
pub struct ClassifierCompositeItemProcessor<I, O, K> {
    classifier: Arc<dyn Fn(&I) -> K + Send + Sync>,
    routes: HashMap<K, DynItemProcessor<I, O>>,
    fallback: Option<DynItemProcessor<I, O>>,
}

impl<I, O, K> ClassifierCompositeItemProcessor<I, O, K>
where
    K: Eq + Hash + Send + Sync + std::fmt::Debug,
{
    pub fn new(classifier: impl Fn(&I) -> K + Send + Sync + 'static) -> Self {
        Self {
            classifier: Arc::new(classifier),
            routes: HashMap::new(),
            fallback: None,
        }
    }

    /// Registers the processor for one key.
    pub fn route(mut self, key: K, processor: DynItemProcessor<I, O>) -> Self {
        self.routes.insert(key, processor);
        self
    }

    /// Processor used for keys without a route.
    pub fn fallback(mut self, processor: DynItemProcessor<I, O>) -> Self {
        self.fallback = Some(processor);
        self
    }
}

impl<I, O, K> ItemProcessor for ClassifierCompositeItemProcessor<I, O, K>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
    K: Eq + Hash + Send + Sync + std::fmt::Debug,
{
    type Input = I;
    type Output = O;

    fn process<'a>(&'a self, item: &'a I) -> BoxFuture<'a, Result<Option<O>, ItemError>> {
        let key = (self.classifier)(item);
        match self.routes.get(&key).or(self.fallback.as_ref()) {
            Some(processor) => processor.process(item),
            None => Box::pin(future::ready(Err(ItemError::new(
                "classifier.unmatched",
                format!("no processor for key {:?}", key),
            )))),
        }
    }
}

// =============================================================================
// Writers
// =============================================================================

/// Collects written items in memory, remembering chunk boundaries.
///
/// Clones share the same storage, so a test can keep one handle and give the
/// other to a step.
pub struct ListItemWriter<T> {
    batches: Arc<Mutex<Vec<Vec<T>>>>,
}

impl<T> ListItemWriter<T> {
    pub fn new() -> Self {
        Self {
            batches: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> ListItemWriter<T> {
    /// Every written item, in write order.
    pub fn items(&self) -> Vec<T> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    /// Each `write` call's items.
    pub fn batches(&self) -> Vec<Vec<T>> {
        self.batches.lock().clone()
    }

    /// Sizes of each `write` call.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(Vec::len).collect()
    }
}

impl<T> Default for ListItemWriter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ListItemWriter<T> {
    fn clone(&self) -> Self {
        Self {
            batches: Arc::clone(&self.batches),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ItemWriter for ListItemWriter<T> {
    type Item = T;

    fn write<'a>(&'a self, items: &'a [T]) -> BoxFuture<'a, Result<(), ItemError>> {
        self.batches.lock().push(items.to_vec());
        Box::pin(future::ready(Ok(())))
    }
}

/// Writer backed by a synchronous closure.
pub struct FnItemWriter<F, T> {
    f: F,
    _item: PhantomData<fn(T)>,
}

impl<F, T> FnItemWriter<F, T>
where
    F: Fn(&[T]) -> Result<(), ItemError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _item: PhantomData,
        }
    }
}

impl<F, T> ItemWriter for FnItemWriter<F, T>
where
    F: Fn(&[T]) -> Result<(), ItemError> + Send + Sync,
    T: Send + Sync + 'static,
{
    type Item = T;

    fn write<'a>(&'a self, items: &'a [T]) -> BoxFuture<'a, Result<(), ItemError>> {
        Box::pin(future::ready((self.f)(items)))
    }
}

/// Shared writer trait object used in dispatch tables.
pub type DynItemWriter<T> = Arc<dyn ItemWriter<Item = T>>;

/// Writes every chunk to each delegate in order.
pub struct CompositeItemWriter<T> {
    delegates: Vec<DynItemWriter<T>>,
}

impl<T> CompositeItemWriter<T> {
    pub fn new(delegates: Vec<DynItemWriter<T>>) -> Self {
        Self { delegates }
    }
}

impl<T: Send + Sync + 'static> ItemWriter for CompositeItemWriter<T> {
    type Item = T;

    fn write<'a>(&'a self, items: &'a [T]) -> BoxFuture<'a, Result<(), ItemError>> {
        Box::pin(async move {
            for writer in &self.delegates {
                writer.write(items).await?;
            }
            Ok(())
        })
    }

    fn open(&self, ctx: &ExecutionContext) -> Result<(), ItemError> {
        self.delegates.iter().try_for_each(|w| w.open(ctx))
    }

    fn update(&self, ctx: &mut ExecutionContext) -> Result<(), ItemError> {
        self.delegates.iter().try_for_each(|w| w.update(ctx))
    }

    fn close(&self) -> Result<(), ItemError> {
        self.delegates.iter().try_for_each(|w| w.close())
    }
}

/// Splits a chunk by classification key and writes each group to its writer.
///
/// Groups are written in order of each key's first appearance; order within
/// a group follows the chunk.
pub struct ClassifierCompositeItemWriter<T, K> {
    classifier: Arc<dyn Fn(&T) -> K + Send + Sync>,
    routes: HashMap<K, DynItemWriter<T>>,
}

impl<T, K> ClassifierCompositeItemWriter<T, K>
where
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug,
{
    pub fn new(classifier: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        Self {
            classifier: Arc::new(classifier),
            routes: HashMap::new(),
        }
    }

    pub fn route(mut self, key: K, writer: DynItemWriter<T>) -> Self {
        self.routes.insert(key, writer);
        self
    }
}

impl<T, K> ItemWriter for ClassifierCompositeItemWriter<T, K>
where
    T: Clone + Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + std::fmt::Debug,
{
    type Item = T;

    fn write<'a>(&'a self, items: &'a [T]) -> BoxFuture<'a, Result<(), ItemError>> {
        Box::pin(async move {
            let mut order: Vec<K> = Vec::new();
            let mut groups: HashMap<K, Vec<T>> = HashMap::new();
            for item in items {
                let key = (self.classifier)(item);
                if !groups.contains_key(&key) {
                    order.push(key.clone());
                }
                groups.entry(key).or_default().push(item.clone());
            }

            for key in order {
                let writer = self.routes.get(&key).ok_or_else(|| {
                    ItemError::new("classifier.unmatched", format!("no writer for key {:?}", key))
                })?;
                let group = groups.remove(&key).unwrap_or_default();
                writer.write(&group).await?;
            }
            Ok(())
        })
    }
}
