// Coroutines as resumable execution contexts.
//
// Each thread owns a `LuaState`. The running thread's state lives in
// `LuaVM::state`; resuming swaps the target's state in from the thread
// arena and parks the resumer's state there (status `normal`) until the
// coroutine yields, returns or dies. A yield is an `Err(LuaError::Yield)`
// travelling up to `resume`, leaving every frame of the coroutine in place.

use crate::gc::ThreadId;
use crate::lua_value::{LuaThread, LuaValue};
use crate::lua_vm::call_status::CIST_YIELD;
use crate::lua_vm::lua_limits::EXTRA_STACK;
use crate::lua_vm::{CoroutineStatus, LuaError, LuaResult, LuaState, LuaVM, RuntimeErrorKind};

/// Outcome of one `resume`
#[derive(Debug)]
pub enum ResumeResult {
    /// The coroutine yielded these values and can be resumed again
    Yielded(Vec<LuaValue>),
    /// The body returned; the coroutine is dead
    Returned(Vec<LuaValue>),
    /// The body raised an error; the coroutine is dead
    Errored(LuaError),
}

impl LuaVM {
    /// New suspended coroutine running `f`
    pub fn create_thread(&mut self, f: LuaValue) -> LuaResult<LuaValue> {
        self.check_handle(&f)?;
        let mut state = LuaState::new();
        state.stack[0] = f;
        state.top = 1;
        let tid = self.alloc_thread(LuaThread {
            state: Some(Box::new(state)),
        });
        Ok(LuaValue::Thread(tid))
    }

    /// The running thread and whether it is the main one
    pub fn running_thread(&self) -> (LuaValue, bool) {
        (
            LuaValue::Thread(self.current_thread),
            self.current_thread == self.main_thread,
        )
    }

    pub fn thread_status(&self, tid: ThreadId) -> CoroutineStatus {
        if tid == self.current_thread {
            return self.state.status;
        }
        match self.pool.threads.get(tid).and_then(|t| t.state.as_ref()) {
            Some(state) => state.status,
            None => CoroutineStatus::Running,
        }
    }

    /// The running coroutine may yield
    pub fn is_yieldable(&self) -> bool {
        self.state.nny == 0
    }

    fn coroutine_error(&mut self, msg: &str) -> LuaError {
        self.error_with_kind(RuntimeErrorKind::Coroutine, msg.to_string())
    }

    /// Park the running state and make `tid` the running thread
    fn switch_to(&mut self, tid: ThreadId) -> LuaResult<()> {
        let Some(incoming) = self.pool.threads[tid].state.take() else {
            return Err(self.coroutine_error("cannot resume non-suspended coroutine"));
        };
        let mut outgoing = std::mem::replace(&mut self.state, incoming);
        outgoing.status = CoroutineStatus::Normal;
        self.pool.threads[self.current_thread].state = Some(outgoing);
        self.resume_chain.push(self.current_thread);
        self.current_thread = tid;
        self.state.status = CoroutineStatus::Running;
        Ok(())
    }

    /// Park the running coroutine with `status` and return to its resumer
    fn switch_back(&mut self, status: CoroutineStatus) {
        let Some(prev) = self.resume_chain.pop() else {
            return;
        };
        let Some(mut incoming) = self.pool.threads[prev].state.take() else {
            return;
        };
        incoming.status = CoroutineStatus::Running;
        let mut outgoing = std::mem::replace(&mut self.state, incoming);
        outgoing.status = status;
        self.pool.threads[self.current_thread].state = Some(outgoing);
        self.current_thread = prev;
    }

    /// Resume a suspended coroutine with `args`
    pub fn resume(&mut self, co: LuaValue, args: &[LuaValue]) -> LuaResult<ResumeResult> {
        self.check_handles(&co, args)?;
        let LuaValue::Thread(tid) = co else {
            return Err(self.coroutine_error("cannot resume non-suspended coroutine"));
        };
        match self.thread_status(tid) {
            CoroutineStatus::Suspended => {}
            CoroutineStatus::Dead => return Err(self.coroutine_error("cannot resume dead coroutine")),
            _ => return Err(self.coroutine_error("cannot resume non-suspended coroutine")),
        }
        if self.n_ccalls >= self.options.max_native_depth {
            return Err(self.error_with_kind(RuntimeErrorKind::StackOverflow, "C stack overflow".to_string()));
        }

        self.switch_to(tid)?;
        self.n_ccalls += 1;
        tracing::debug!(thread = tid.0, nargs = args.len(), "coroutine resumed");
        let outcome = self.run_coroutine(args);
        self.n_ccalls -= 1;

        let (status, result) = match outcome {
            Ok(()) => {
                let results = self.state.stack[..self.state.top].to_vec();
                self.state.top = 0;
                tracing::debug!(thread = tid.0, "coroutine returned");
                (CoroutineStatus::Dead, ResumeResult::Returned(results))
            }
            Err(LuaError::Yield) => {
                let values = std::mem::take(&mut self.yield_values);
                tracing::debug!(thread = tid.0, nvalues = values.len(), "coroutine yielded");
                (CoroutineStatus::Suspended, ResumeResult::Yielded(values))
            }
            Err(e) => {
                let mut e = self.attach_traceback(e);
                let value = self.error_value(&e);
                // Keeps the error object reachable while `__close` handlers run
                self.state.error_value = Some(value);
                self.state.top = self.state.live_top();
                self.close_upvalues(0);
                let closed = self.close_tbc_with_error(0, value);
                if closed != value {
                    e = self.error_with_value(closed);
                }
                self.close_upvalues(0);
                self.state.call_infos.clear();
                self.state.top = 0;
                self.state.error_value = Some(closed);
                tracing::debug!(thread = tid.0, error = %e, "coroutine died");
                (CoroutineStatus::Dead, ResumeResult::Errored(e))
            }
        };
        self.switch_back(status);
        Ok(result)
    }

    fn run_coroutine(&mut self, args: &[LuaValue]) -> LuaResult<()> {
        if !self.state.is_started() {
            // Body function at slot 0, arguments above it
            self.grow_stack(1 + args.len() + EXTRA_STACK)?;
            self.state.stack[1..1 + args.len()].copy_from_slice(args);
            self.state.top = 1 + args.len();
            return match self.precall(0, -1) {
                Ok(true) => self.execute_from(0),
                Ok(false) => Ok(()),
                Err(e) => self
                    .recover_or_raise(0, e)
                    .and_then(|_| self.execute_from(0)),
            };
        }

        // Deliver the resume arguments as results of the pending yield
        let first = self.state.top;
        self.grow_stack(first + args.len() + EXTRA_STACK)?;
        self.state.stack[first..first + args.len()].copy_from_slice(args);
        self.state.top = first + args.len();
        if let Some(ci) = self.state.call_infos.last_mut() {
            ci.call_status &= !CIST_YIELD;
        }
        self.poscall(first, args.len());
        self.execute_from(0)
    }

    /// Suspend the running coroutine, handing `values` to its resumer.
    /// Natives return the result of this call directly.
    pub fn yield_values(&mut self, values: Vec<LuaValue>) -> LuaResult<usize> {
        if self.current_thread == self.main_thread {
            return Err(self.coroutine_error("attempt to yield from outside a coroutine"));
        }
        if self.state.nny > 0 {
            return Err(self.coroutine_error("attempt to yield across a C-call boundary"));
        }
        self.yield_values = values;
        if let Some(ci) = self.state.call_infos.last_mut() {
            ci.call_status |= CIST_YIELD;
        }
        Err(LuaError::Yield)
    }

    /// Close a suspended or dead coroutine: pending to-be-closed variables
    /// run and the coroutine becomes dead. Returns the error object when the
    /// coroutine had died by an error or a close method failed.
    pub fn close_thread(&mut self, co: LuaValue) -> LuaResult<Option<LuaValue>> {
        self.check_handle(&co)?;
        let LuaValue::Thread(tid) = co else {
            return Err(self.coroutine_error("cannot close a non-thread value"));
        };
        match self.thread_status(tid) {
            CoroutineStatus::Suspended | CoroutineStatus::Dead => {}
            CoroutineStatus::Running => return Err(self.coroutine_error("cannot close a running coroutine")),
            CoroutineStatus::Normal => return Err(self.coroutine_error("cannot close a normal coroutine")),
        }

        self.switch_to(tid)?;
        let pending = self.state.error_value.take();
        self.state.top = self.state.live_top();
        self.close_upvalues(0);
        let closed = self.close_tbc_with_error(0, pending.unwrap_or_default());
        self.close_upvalues(0);
        self.state.call_infos.clear();
        self.state.top = 0;
        self.switch_back(CoroutineStatus::Dead);
        tracing::debug!(thread = tid.0, "coroutine closed");

        Ok(if pending.is_some() || !closed.is_nil() {
            Some(closed)
        } else {
            None
        })
    }
}
