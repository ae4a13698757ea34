//! # Active stack
//!
//! The transactions and spans active in one logical thread of control. There is no
//! implicit thread-local: every thread, task or request owns an [`ActiveStack`] and passes
//! it along, [`ActiveStack::fork`] hands the active span over to another thread.
//!
//! Every activation takes a reference on the activated span and the matching
//! deactivation releases it. Activations must nest. A deactivation that does not match
//! the top of the stack pops up to the matching frame and is reported as misuse.
use crate::apm_warn_once;
use crate::propagation::{HeaderGetter, TextValue};
use crate::trace::{AbstractSpan, Sampler, Tracer, Transaction};
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Stack of active transactions and spans of one logical thread of control.
pub struct ActiveStack {
    tracer: Tracer,
    stack: Vec<AbstractSpan>,
    max_depth: usize,
    overflow: usize,
}

impl ActiveStack {
    /// An empty stack for `tracer`.
    pub fn new(tracer: &Tracer) -> Self {
        let max_depth = tracer.config().activation_stack_max_depth();
        ActiveStack {
            tracer: tracer.clone(),
            stack: Vec::with_capacity(max_depth.min(16)),
            max_depth,
            overflow: 0,
        }
    }

    /// A new stack with the currently active span activated on it.
    ///
    /// Move the result to the thread or task that continues the work.
    pub fn fork(&self) -> ActiveStack {
        let mut forked = ActiveStack::new(&self.tracer);
        if let Some(active) = self.active() {
            forked.activate(active.clone());
        }
        forked
    }

    /// The innermost active transaction or span.
    pub fn active(&self) -> Option<&AbstractSpan> {
        self.stack.last()
    }

    /// Transaction of the bottom-most active entry.
    pub fn current_transaction(&self) -> Option<Transaction> {
        self.stack.first().and_then(AbstractSpan::transaction)
    }

    /// Number of active entries, not counting ignored overflowing activations.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Makes `span` the active span.
    ///
    /// Returns `false` if the stack is full. The activation is ignored then, and so is
    /// its matching deactivation.
    pub fn activate(&mut self, span: impl Into<AbstractSpan>) -> bool {
        let span = span.into();
        if self.stack.len() >= self.max_depth {
            self.overflow += 1;
            apm_warn_once!(
                name: "ActiveStack.Overflow",
                message = "Activation stack is full, ignoring activation",
                max_depth = self.max_depth,
                span = span.id(),
            );
            return false;
        }
        span.increment_references();
        self.stack.push(span);
        true
    }

    /// Deactivates `span`, which should be the active span.
    ///
    /// If `span` is further down, the entries above it are deactivated as well. Returns
    /// `false` if `span` is not on the stack.
    ///
    /// # Panics
    ///
    /// Panics on unbalanced deactivation when assertions are enabled.
    pub fn deactivate(&mut self, span: &AbstractSpan) -> bool {
        if self.overflow > 0 {
            self.overflow -= 1;
            return true;
        }
        let Some(position) = self.stack.iter().rposition(|entry| entry.ptr_eq(span)) else {
            apm_warn_once!(
                name: "ActiveStack.DeactivateInactive",
                message = "Deactivating a span that is not active",
                span = span.id(),
            );
            if self.tracer.config().assertions_enabled {
                panic!("span {} is not active", span.id());
            }
            return false;
        };
        if position + 1 != self.stack.len() {
            apm_warn_once!(
                name: "ActiveStack.UnbalancedDeactivation",
                message = "Deactivating a span that is not on top of the stack",
                span = span.id(),
                depth = self.stack.len(),
                position = position,
            );
            if self.tracer.config().assertions_enabled {
                panic!("span {} is not on top of the activation stack", span.id());
            }
        }
        for entry in self.stack.drain(position..).rev() {
            entry.decrement_references();
        }
        true
    }

    /// Activates `span` until the returned guard is dropped.
    pub fn scope(&mut self, span: impl Into<AbstractSpan>) -> ActivationScope<'_> {
        let span = span.into();
        let active = self.activate(span.clone());
        ActivationScope {
            stack: self,
            span,
            active,
        }
    }

    /// Starts a root transaction and activates it.
    ///
    /// Deactivate the transaction before ending it.
    pub fn start_root_transaction(&mut self, sampler: Option<&dyn Sampler>) -> Transaction {
        let transaction = self.tracer.start_root_transaction(sampler);
        self.activate(transaction.clone());
        transaction
    }

    /// Starts a transaction continuing the trace of `carrier` and activates it.
    pub fn start_child_transaction<T, C>(
        &mut self,
        carrier: &C,
        getter: &impl HeaderGetter<T, C>,
        sampler: Option<&dyn Sampler>,
    ) -> Transaction
    where
        T: TextValue + ?Sized,
        C: ?Sized,
    {
        let transaction = self.tracer.start_child_transaction(carrier, getter, sampler);
        self.activate(transaction.clone());
        transaction
    }
}

impl Drop for ActiveStack {
    fn drop(&mut self) {
        if !self.stack.is_empty() {
            apm_warn_once!(
                name: "ActiveStack.DroppedWithActiveSpans",
                message = "Dropping an activation stack that still holds active spans",
                depth = self.stack.len(),
            );
        }
        for entry in self.stack.drain(..).rev() {
            entry.decrement_references();
        }
    }
}

impl fmt::Debug for ActiveStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveStack")
            .field("depth", &self.stack.len())
            .field("overflow", &self.overflow)
            .field("active", &self.active().map(|span| span.id()))
            .finish()
    }
}

/// Keeps a span active, see [`ActiveStack::scope`].
///
/// Dereferences to the stack so that nested spans can be activated in turn.
#[derive(Debug)]
pub struct ActivationScope<'a> {
    stack: &'a mut ActiveStack,
    span: AbstractSpan,
    active: bool,
}

impl ActivationScope<'_> {
    /// The span kept active.
    pub fn span(&self) -> &AbstractSpan {
        &self.span
    }
}

impl Deref for ActivationScope<'_> {
    type Target = ActiveStack;

    fn deref(&self) -> &ActiveStack {
        self.stack
    }
}

impl DerefMut for ActivationScope<'_> {
    fn deref_mut(&mut self) -> &mut ActiveStack {
        self.stack
    }
}

impl Drop for ActivationScope<'_> {
    fn drop(&mut self) {
        if self.active {
            self.stack.deactivate(&self.span);
        } else {
            self.stack.overflow = self.stack.overflow.saturating_sub(1);
        }
    }
}
