use super::Semaphore;
use crate::proc::{self, Pid};

/// Reentrant mutex: a binary semaphore plus an owner/depth pair.
///
/// The owner may re-acquire without blocking; the semaphore is released only
/// when the outermost acquisition is undone. The channel driver leans on the
/// reentrancy when identify runs inside a locked partition scan.
pub struct Mutex {
    name: &'static str,
    sema: Semaphore,
    state: spin::Mutex<MutexState>,
}

struct MutexState {
    owner: Option<Pid>,
    depth: u32,
}

impl Mutex {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            sema: Semaphore::new(name, 1),
            state: spin::Mutex::new(MutexState {
                owner: None,
                depth: 0,
            }),
        }
    }

    pub fn acquire(&self) {
        let me = proc::current().pid;
        {
            let mut st = self.state.lock();
            if st.owner == Some(me) {
                st.depth += 1;
                return;
            }
        }
        self.sema.down();
        let mut st = self.state.lock();
        debug_assert!(st.owner.is_none(), "{} acquired while owned", self.name);
        st.owner = Some(me);
        st.depth = 1;
    }

    pub fn release(&self) {
        let me = proc::current().pid;
        let mut st = self.state.lock();
        assert_eq!(
            st.owner,
            Some(me),
            "{} released by a task that does not hold it",
            self.name
        );
        st.depth -= 1;
        if st.depth == 0 {
            st.owner = None;
            drop(st);
            self.sema.up();
        }
    }

    pub fn holding(&self) -> bool {
        self.state.lock().owner == Some(proc::current().pid)
    }
}
