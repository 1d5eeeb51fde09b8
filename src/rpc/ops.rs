//! Message operations
//!
//! The data path: send and get-msg on the request queue, post-reply and
//! get-reply on the reply queue, call as the send+get-reply pair, and
//! poll for readiness. Every copy to or from a caller's buffer happens
//! with the slot lock dropped; after re-locking, teardown is checked
//! before the copy result so a dying connection reports `Disconnected`
//! rather than whatever the copy did.

use alloc::boxed::Box;
use core::mem;

use super::connection::{CnxOptions, LockedCnx};
use super::message::RpcMessage;
use super::registry::RpcRegistry;
use super::{
    MsgInfo, PollEvents, RpcCnxId, RpcError, RpcFlags, RpcResult, RpcToken, RPC_MAX_MSG_LENGTH,
    RPC_TOKEN_INVALID,
};
use crate::kern::{
    copy_in_value, copy_out_value, ActionMask, BufferKind, VmAddr, WaitChannel, WaitClass,
    WaitStatus,
};
use crate::types::WorldId;

/// Outcome of one queue inspection under the lock.
enum Dequeue {
    Got(Box<RpcMessage>),
    TooSmall,
    Empty,
}

impl RpcRegistry {
    // ========================================================================
    // SEND / GET MSG
    // ========================================================================

    /// Queue a message on the connection. Payloads longer than
    /// `RPC_MAX_MSG_LENGTH` are truncated, never refused. Returns the
    /// token the receiver must reply with, or `RPC_TOKEN_INVALID` when
    /// no reply is expected.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &self,
        id: RpcCnxId,
        function: i32,
        flags: RpcFlags,
        forced_token: RpcToken,
        src: VmAddr,
        src_len: u32,
        kind: BufferKind,
    ) -> RpcResult<RpcToken> {
        let mut len = src_len;
        if len > RPC_MAX_MSG_LENGTH {
            log::warn!(
                "rpc: send of {} bytes truncated to {}",
                len,
                RPC_MAX_MSG_LENGTH
            );
            len = RPC_MAX_MSG_LENGTH;
        }
        let mut locked = self.find_and_lock(id)?;
        let idx = locked.idx();
        let mut msg = match locked.state_mut().alloc_message(len) {
            Some(msg) => msg,
            None => {
                self.release_and_unlock(locked);
                return Err(RpcError::LimitExceeded);
            }
        };

        // Copy in with the lock dropped; the buffer is ours alone.
        let r = locked.unlock();
        let copy_res = if len > 0 {
            self.hooks
                .copy
                .copy_in(&mut msg.buf_mut()[..len as usize], src, kind)
        } else {
            Ok(())
        };
        locked = r.lock();
        if locked.state().pending_destroy {
            locked.state_mut().free_message(msg);
            self.release_and_unlock(locked);
            return Err(RpcError::Disconnected);
        }
        if let Err(fault) = copy_res {
            locked.state_mut().free_message(msg);
            self.release_and_unlock(locked);
            return Err(fault.into());
        }

        msg.len = len;
        msg.function = function;
        msg.sender = self.hooks.sched.current_world();
        let token = if flags.contains(RpcFlags::REPLY_EXPECTED) {
            locked.state_mut().next_token()
        } else if flags.contains(RpcFlags::FORCE_TOKEN) {
            forced_token
        } else {
            RPC_TOKEN_INVALID
        };
        msg.token = token;

        let (notify_host, poll_waiters) = {
            let state = locked.state_mut();
            state.messages.push_back(msg);
            state.n_queued += 1;
            let waiters = mem::take(&mut state.poll_waiters);
            (state.options.contains(CnxOptions::NOTIFY_HOST), waiters)
        };
        self.pending.set(idx);
        self.hooks.sched.wakeup(locked.wait_channel());
        self.release_and_unlock(locked);

        // Doorbell and poll wakeups ring with no lock held.
        if notify_host {
            self.hooks.host.interrupt_host();
        }
        for world in poll_waiters {
            self.hooks.sched.wakeup(WaitChannel::world_poll(world));
        }
        Ok(token)
    }

    /// Receive the next queued message. The caller passes a [`MsgInfo`]
    /// by address with `data`/`data_len` describing its buffer; on
    /// success the header fields are written back through the same
    /// address. `timeout_ms` of zero means wait forever.
    pub fn get_msg(
        &self,
        id: RpcCnxId,
        flags: RpcFlags,
        info: VmAddr,
        timeout_ms: u32,
        kind: BufferKind,
        switch_hint: Option<WorldId>,
    ) -> RpcResult<()> {
        self.get_msg_inner(id, flags, info, timeout_ms, false, kind, switch_hint)
    }

    /// [`RpcRegistry::get_msg`], but the caller waits at most once: any
    /// wakeup that delivers no message, an interrupt or posted action
    /// included, ends the call with `WaitInterrupted`.
    pub fn get_msg_interruptible(
        &self,
        id: RpcCnxId,
        flags: RpcFlags,
        info: VmAddr,
        timeout_ms: u32,
        kind: BufferKind,
        switch_hint: Option<WorldId>,
    ) -> RpcResult<()> {
        self.get_msg_inner(id, flags, info, timeout_ms, true, kind, switch_hint)
    }

    #[allow(clippy::too_many_arguments)]
    fn get_msg_inner(
        &self,
        id: RpcCnxId,
        flags: RpcFlags,
        info_addr: VmAddr,
        timeout_ms: u32,
        interruptible: bool,
        kind: BufferKind,
        switch_hint: Option<WorldId>,
    ) -> RpcResult<()> {
        let copy = &*self.hooks.copy;
        let mut info: MsgInfo = copy_in_value(copy, info_addr, kind)?;
        if info.data.is_null() {
            return Err(RpcError::BadParam);
        }
        let deadline_us = if timeout_ms != 0 {
            Some(self.hooks.clock.now_us() + u64::from(timeout_ms) * 1000)
        } else {
            None
        };

        let mut locked = self.find_and_lock(id)?;
        let idx = locked.idx();
        let mut interrupted = false;
        let msg = loop {
            let step = {
                let state = locked.state_mut();
                match state.messages.pop_front() {
                    None => Dequeue::Empty,
                    Some(head) if head.len > info.data_len => {
                        // Leave it queued; the caller can retry with a
                        // bigger buffer.
                        state.messages.push_front(head);
                        Dequeue::TooSmall
                    }
                    Some(head) => {
                        state.n_queued -= 1;
                        Dequeue::Got(head)
                    }
                }
            };
            match step {
                Dequeue::Got(msg) => {
                    if locked.state().messages.is_empty() {
                        self.pending.clear(idx);
                    }
                    break msg;
                }
                Dequeue::TooSmall => {
                    self.release_and_unlock(locked);
                    return Err(RpcError::NoResources);
                }
                Dequeue::Empty => {}
            }

            if !flags.contains(RpcFlags::CAN_BLOCK) {
                self.release_and_unlock(locked);
                return Err(RpcError::WouldBlock);
            }
            if interruptible && interrupted {
                self.release_and_unlock(locked);
                return Err(RpcError::WaitInterrupted);
            }
            if let Some(deadline) = deadline_us {
                if self.hooks.clock.now_us() >= deadline {
                    self.release_and_unlock(locked);
                    return Err(RpcError::Timeout);
                }
            }

            let timer = deadline_us.map(|d| self.hooks.timers.add_oneshot(d, locked.wait_channel()));
            // Action wakeups only for interruptible semaphore waits.
            let actions = if interruptible && locked.state().options.contains(CnxOptions::SEMAPHORE)
            {
                self.hooks.sched.action_wake_mask()
            } else {
                ActionMask::NONE
            };
            let (relocked, res) = self.wait_cnx(locked, actions, switch_hint);
            locked = relocked;
            if let Some(handle) = timer {
                self.hooks.timers.remove(handle);
            }
            match res {
                // Any completed wait counts: an interruptible caller
                // gives up the next time around, whatever woke it.
                Ok(()) | Err(RpcError::WaitInterrupted) => {
                    interrupted = true;
                }
                Err(err) => {
                    self.release_and_unlock(locked);
                    return Err(err);
                }
            }
        };

        // Payload copy, then the header write-back, each with the lock
        // dropped and teardown re-checked first.
        let r = locked.unlock();
        let copy_res = copy.copy_out(info.data, msg.payload(), kind);
        locked = r.lock();
        if locked.state().pending_destroy {
            locked.state_mut().free_message(msg);
            self.release_and_unlock(locked);
            return Err(RpcError::Disconnected);
        }
        if let Err(fault) = copy_res {
            // The message is consumed either way.
            locked.state_mut().free_message(msg);
            self.release_and_unlock(locked);
            return Err(fault.into());
        }

        info.token = msg.token;
        info.function = msg.function;
        info.data_len = msg.len;
        info.world = msg.sender;
        let r = locked.unlock();
        let info_res = copy_out_value(copy, info_addr, &info, kind);
        locked = r.lock();
        if locked.state().pending_destroy {
            locked.state_mut().free_message(msg);
            self.release_and_unlock(locked);
            return Err(RpcError::Disconnected);
        }
        if let Err(fault) = info_res {
            locked.state_mut().free_message(msg);
            self.release_and_unlock(locked);
            return Err(fault.into());
        }
        locked.state_mut().free_message(msg);
        self.release_and_unlock(locked);
        Ok(())
    }

    // ========================================================================
    // REPLIES
    // ========================================================================

    /// Queue a reply under the sender's token. Truncates like
    /// [`RpcRegistry::send`] but rings no doorbell and sets no summary
    /// bit; replies wake only the connection's own waiters.
    pub fn post_reply(
        &self,
        id: RpcCnxId,
        token: RpcToken,
        src: VmAddr,
        src_len: u32,
        kind: BufferKind,
    ) -> RpcResult<()> {
        let mut len = src_len;
        if len > RPC_MAX_MSG_LENGTH {
            log::warn!(
                "rpc: reply of {} bytes truncated to {}",
                len,
                RPC_MAX_MSG_LENGTH
            );
            len = RPC_MAX_MSG_LENGTH;
        }
        let mut locked = self.find_and_lock(id)?;
        let mut msg = match locked.state_mut().alloc_message(len) {
            Some(msg) => msg,
            None => {
                self.release_and_unlock(locked);
                return Err(RpcError::LimitExceeded);
            }
        };

        let r = locked.unlock();
        let copy_res = if len > 0 {
            self.hooks
                .copy
                .copy_in(&mut msg.buf_mut()[..len as usize], src, kind)
        } else {
            Ok(())
        };
        locked = r.lock();
        if locked.state().pending_destroy {
            locked.state_mut().free_message(msg);
            self.release_and_unlock(locked);
            return Err(RpcError::Disconnected);
        }
        if let Err(fault) = copy_res {
            locked.state_mut().free_message(msg);
            self.release_and_unlock(locked);
            return Err(fault.into());
        }

        msg.len = len;
        msg.function = 0;
        msg.sender = self.hooks.sched.current_world();
        msg.token = token;
        {
            let state = locked.state_mut();
            state.replies.push_back(msg);
            state.n_queued += 1;
        }
        self.hooks.sched.wakeup(locked.wait_channel());
        self.release_and_unlock(locked);
        Ok(())
    }

    /// Collect the reply posted under `token`. Replies are matched by
    /// token, not position, so waiters for different tokens can share
    /// the connection. On success `out_len` is updated to the reply's
    /// length.
    #[allow(clippy::too_many_arguments)]
    pub fn get_reply(
        &self,
        id: RpcCnxId,
        token: RpcToken,
        flags: RpcFlags,
        out: VmAddr,
        out_len: &mut u32,
        kind: BufferKind,
        switch_hint: Option<WorldId>,
    ) -> RpcResult<()> {
        if out.is_null() {
            return Err(RpcError::BadParam);
        }
        let mut locked = self.find_and_lock(id)?;
        let mut tried_once = false;
        loop {
            let step = {
                let state = locked.state_mut();
                match state.replies.iter().position(|m| m.token == token) {
                    None => Dequeue::Empty,
                    Some(pos) if state.replies[pos].len > *out_len => Dequeue::TooSmall,
                    Some(pos) => match state.replies.remove(pos) {
                        Some(msg) => {
                            state.n_queued -= 1;
                            Dequeue::Got(msg)
                        }
                        None => Dequeue::Empty,
                    },
                }
            };
            match step {
                Dequeue::TooSmall => {
                    self.release_and_unlock(locked);
                    return Err(RpcError::NoResources);
                }
                Dequeue::Got(msg) => {
                    let r = locked.unlock();
                    let copy_res = self.hooks.copy.copy_out(out, msg.payload(), kind);
                    locked = r.lock();
                    if locked.state().pending_destroy {
                        // Teardown wins; the reply goes down with the
                        // pool.
                        locked.state_mut().free_message(msg);
                        self.release_and_unlock(locked);
                        return Err(RpcError::Disconnected);
                    }
                    return match copy_res {
                        Ok(()) => {
                            *out_len = msg.len;
                            locked.state_mut().free_message(msg);
                            self.release_and_unlock(locked);
                            Ok(())
                        }
                        Err(fault) => {
                            // Requeue at the front so a retry finds it
                            // first.
                            let state = locked.state_mut();
                            state.replies.push_front(msg);
                            state.n_queued += 1;
                            self.release_and_unlock(locked);
                            Err(fault.into())
                        }
                    };
                }
                Dequeue::Empty => {}
            }

            if !flags.contains(RpcFlags::CAN_BLOCK) {
                self.release_and_unlock(locked);
                return Err(RpcError::WouldBlock);
            }
            if flags.contains(RpcFlags::ALLOW_INTERRUPTIONS) && tried_once {
                self.release_and_unlock(locked);
                return Err(RpcError::WaitInterrupted);
            }
            let (relocked, res) = self.wait_cnx(locked, ActionMask::NONE, switch_hint);
            locked = relocked;
            match res {
                Ok(()) | Err(RpcError::WaitInterrupted) => {
                    tried_once = true;
                }
                Err(err) => {
                    self.release_and_unlock(locked);
                    return Err(err);
                }
            }
        }
    }

    /// Send `input` under a fresh token and wait for the reply into
    /// `output`. Returns the reply length. The round-trip latency is
    /// folded into the calling world's stats even when the reply never
    /// arrives.
    pub fn call(
        &self,
        id: RpcCnxId,
        function: i32,
        switch_hint: Option<WorldId>,
        input: &[u8],
        output: &mut [u8],
    ) -> RpcResult<usize> {
        let token = self.send(
            id,
            function,
            RpcFlags::REPLY_EXPECTED,
            RPC_TOKEN_INVALID,
            VmAddr(input.as_ptr() as usize),
            input.len() as u32,
            BufferKind::Kernel,
        )?;
        let started_us = self.hooks.clock.now_us();
        let mut reply_len = output.len() as u32;
        let res = self.get_reply(
            id,
            token,
            RpcFlags::CAN_BLOCK,
            VmAddr(output.as_mut_ptr() as usize),
            &mut reply_len,
            BufferKind::Kernel,
            switch_hint,
        );
        let delta_us = self.hooks.clock.now_us().saturating_sub(started_us);
        self.record_user_call(self.hooks.sched.current_world(), function, delta_us);
        res.map(|()| reply_len as usize)
    }

    // ========================================================================
    // POLL
    // ========================================================================

    /// Check readiness without consuming anything. Only `GET_MSG`
    /// interest is supported; with `notify`, the calling world is woken
    /// on its poll channel when a message arrives. Not ready reports
    /// `WouldBlock`.
    pub fn poll(&self, id: RpcCnxId, interest: PollEvents, notify: bool) -> RpcResult<PollEvents> {
        let mut locked = self.find_and_lock(id)?;
        if interest.intersects(!PollEvents::GET_MSG) {
            log::warn!("rpc {}: poll interest {:#x} not supported", id, interest.bits());
            self.release_and_unlock(locked);
            return Err(RpcError::BadParam);
        }
        let mut ready = PollEvents::empty();
        if interest.contains(PollEvents::GET_MSG) {
            let world = self.hooks.sched.current_world();
            let state = locked.state_mut();
            if !state.messages.is_empty() {
                ready |= PollEvents::GET_MSG;
            } else if notify {
                state.add_poll_waiter(world);
            }
        }
        self.release_and_unlock(locked);
        if interest.contains(PollEvents::GET_MSG) && ready.is_empty() {
            Err(RpcError::WouldBlock)
        } else {
            Ok(ready)
        }
    }

    /// Forget the calling world's poll registration, if it has one.
    /// Lookup failures pass through: `NotFound` for a stale id,
    /// `Disconnected` for a connection in teardown.
    pub fn poll_cleanup(&self, id: RpcCnxId) -> RpcResult<()> {
        let world = self.hooks.sched.current_world();
        let mut locked = self.find_and_lock(id)?;
        locked.state_mut().poll_waiters.retain(|w| *w != world);
        self.release_and_unlock(locked);
        Ok(())
    }

    // ========================================================================
    // WAITING
    // ========================================================================

    /// One blocked stretch on the connection's channel: arm the wait
    /// under the lock, drop it, block, re-lock. Every waiter is tagged
    /// with the class the connection's semaphore option dictates. A
    /// normal wakeup on a connection in teardown turns into
    /// `Disconnected`; an interrupted wait reports `WaitInterrupted`
    /// and the caller decides whether that ends the operation.
    fn wait_cnx<'r>(
        &self,
        locked: LockedCnx<'r>,
        actions: ActionMask,
        switch_hint: Option<WorldId>,
    ) -> (LockedCnx<'r>, RpcResult<()>) {
        let class = if locked.state().options.contains(CnxOptions::SEMAPHORE) {
            WaitClass::Semaphore
        } else {
            WaitClass::Rpc
        };
        let chan = locked.wait_channel();
        self.hooks.sched.assert_wait(chan, class, actions);
        let r = locked.unlock();
        let status = self.hooks.sched.block(switch_hint);
        let locked = r.lock();
        let res = match status {
            WaitStatus::Woken => {
                if locked.state().pending_destroy {
                    Err(RpcError::Disconnected)
                } else {
                    Ok(())
                }
            }
            WaitStatus::Interrupted => Err(RpcError::WaitInterrupted),
        };
        (locked, res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::hosted::HostedKernel;
    use crate::kern::CpuSched;
    use alloc::sync::Arc;
    use alloc::vec;
    use std::thread;
    use std::time::{Duration, Instant};

    const SERVER: WorldId = WorldId(1);
    const CLIENT: WorldId = WorldId(2);

    fn setup(
        num_bufs: u32,
        buf_size: u32,
        options: CnxOptions,
    ) -> (Arc<HostedKernel>, RpcRegistry, RpcCnxId) {
        let k = HostedKernel::new();
        let reg = RpcRegistry::with_capacity(16, k.hooks());
        reg.world_init(SERVER);
        reg.world_init(CLIENT);
        let id = reg
            .register("test.rpc", options, SERVER, num_bufs, buf_size)
            .unwrap();
        (k, reg, id)
    }

    fn send_bytes(
        k: &HostedKernel,
        reg: &RpcRegistry,
        id: RpcCnxId,
        function: i32,
        flags: RpcFlags,
        payload: &[u8],
    ) -> RpcResult<RpcToken> {
        k.run_as_world(CLIENT, || {
            reg.send(
                id,
                function,
                flags,
                RPC_TOKEN_INVALID,
                VmAddr(payload.as_ptr() as usize),
                payload.len() as u32,
                BufferKind::Kernel,
            )
        })
    }

    fn get_one(
        reg: &RpcRegistry,
        id: RpcCnxId,
        flags: RpcFlags,
        timeout_ms: u32,
        buf: &mut [u8],
    ) -> RpcResult<(RpcToken, i32, u32, WorldId)> {
        let mut info = MsgInfo {
            token: RPC_TOKEN_INVALID,
            function: 0,
            data: VmAddr(buf.as_mut_ptr() as usize),
            data_len: buf.len() as u32,
            world: WorldId::INVALID,
        };
        reg.get_msg(
            id,
            flags,
            VmAddr::from_mut(&mut info),
            timeout_ms,
            BufferKind::Kernel,
            None,
        )?;
        Ok((info.token, info.function, info.data_len, info.world))
    }

    fn post_bytes(
        k: &HostedKernel,
        reg: &RpcRegistry,
        id: RpcCnxId,
        token: RpcToken,
        payload: &[u8],
    ) -> RpcResult<()> {
        k.run_as_world(SERVER, || {
            reg.post_reply(
                id,
                token,
                VmAddr(payload.as_ptr() as usize),
                payload.len() as u32,
                BufferKind::Kernel,
            )
        })
    }

    fn get_reply_bytes(
        k: &HostedKernel,
        reg: &RpcRegistry,
        id: RpcCnxId,
        token: RpcToken,
        flags: RpcFlags,
        out: &mut [u8],
    ) -> RpcResult<u32> {
        let mut out_len = out.len() as u32;
        k.run_as_world(CLIENT, || {
            reg.get_reply(
                id,
                token,
                flags,
                VmAddr(out.as_mut_ptr() as usize),
                &mut out_len,
                BufferKind::Kernel,
                None,
            )
        })?;
        Ok(out_len)
    }

    /// Serve `n` requests: receive, echo the payload back reversed.
    fn serve_n(k: &HostedKernel, reg: &RpcRegistry, id: RpcCnxId, n: usize) {
        k.run_as_world(SERVER, || {
            for _ in 0..n {
                let mut buf = [0u8; 64];
                let (token, _, len, _) =
                    get_one(reg, id, RpcFlags::CAN_BLOCK, 0, &mut buf).unwrap();
                let mut echo = buf[..len as usize].to_vec();
                echo.reverse();
                reg.post_reply(
                    id,
                    token,
                    VmAddr(echo.as_ptr() as usize),
                    echo.len() as u32,
                    BufferKind::Kernel,
                )
                .unwrap();
            }
        });
    }

    #[test]
    fn test_send_reply_roundtrip() {
        let (k, reg, id) = setup(4, 64, CnxOptions::empty());
        let token = send_bytes(&k, &reg, id, 1, RpcFlags::REPLY_EXPECTED, b"hello").unwrap();
        assert!(token > 0);

        let mut buf = [0u8; 64];
        let (t, function, len, from) = k
            .run_as_world(SERVER, || {
                get_one(&reg, id, RpcFlags::empty(), 0, &mut buf)
            })
            .unwrap();
        assert_eq!(t, token);
        assert_eq!(function, 1);
        assert_eq!(&buf[..len as usize], b"hello");
        assert_eq!(from, CLIENT);

        post_bytes(&k, &reg, id, token, b"world").unwrap();
        let mut out = [0u8; 64];
        let n = get_reply_bytes(&k, &reg, id, token, RpcFlags::empty(), &mut out).unwrap();
        assert_eq!(&out[..n as usize], b"world");
    }

    #[test]
    fn test_messages_keep_fifo_order() {
        let (k, reg, id) = setup(4, 32, CnxOptions::empty());
        send_bytes(&k, &reg, id, 1, RpcFlags::empty(), b"first").unwrap();
        send_bytes(&k, &reg, id, 2, RpcFlags::empty(), b"second").unwrap();
        let mut buf = [0u8; 32];
        let (t, function, len, _) = get_one(&reg, id, RpcFlags::empty(), 0, &mut buf).unwrap();
        assert_eq!((t, function), (RPC_TOKEN_INVALID, 1));
        assert_eq!(&buf[..len as usize], b"first");
        let (_, function, len, _) = get_one(&reg, id, RpcFlags::empty(), 0, &mut buf).unwrap();
        assert_eq!(function, 2);
        assert_eq!(&buf[..len as usize], b"second");
    }

    #[test]
    fn test_interleaved_replies_match_tokens() {
        let (k, reg, id) = setup(4, 32, CnxOptions::empty());
        let t1 = send_bytes(&k, &reg, id, 1, RpcFlags::REPLY_EXPECTED, b"one").unwrap();
        let t2 = send_bytes(&k, &reg, id, 2, RpcFlags::REPLY_EXPECTED, b"two").unwrap();
        assert_ne!(t1, t2);
        let mut buf = [0u8; 32];
        get_one(&reg, id, RpcFlags::empty(), 0, &mut buf).unwrap();
        get_one(&reg, id, RpcFlags::empty(), 0, &mut buf).unwrap();
        // Replies posted out of order still reach their callers.
        post_bytes(&k, &reg, id, t2, b"for-two").unwrap();
        post_bytes(&k, &reg, id, t1, b"for-one").unwrap();
        let mut out = [0u8; 32];
        let n = get_reply_bytes(&k, &reg, id, t1, RpcFlags::empty(), &mut out).unwrap();
        assert_eq!(&out[..n as usize], b"for-one");
        let n = get_reply_bytes(&k, &reg, id, t2, RpcFlags::empty(), &mut out).unwrap();
        assert_eq!(&out[..n as usize], b"for-two");
    }

    #[test]
    fn test_nonblocking_empty_queues() {
        let (k, reg, id) = setup(2, 16, CnxOptions::empty());
        let mut buf = [0u8; 16];
        assert_eq!(
            get_one(&reg, id, RpcFlags::empty(), 0, &mut buf),
            Err(RpcError::WouldBlock)
        );
        let mut out = [0u8; 16];
        assert_eq!(
            get_reply_bytes(&k, &reg, id, 42, RpcFlags::empty(), &mut out),
            Err(RpcError::WouldBlock)
        );
    }

    #[test]
    fn test_get_msg_timeout_is_bounded() {
        let (k, reg, id) = setup(1, 8, CnxOptions::empty());
        let mut buf = [0u8; 8];
        let start = Instant::now();
        let res = k.run_as_world(SERVER, || {
            get_one(&reg, id, RpcFlags::CAN_BLOCK, 50, &mut buf)
        });
        assert_eq!(res, Err(RpcError::Timeout));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(45), "woke at {:?}", waited);
        assert!(waited < Duration::from_millis(1000), "woke at {:?}", waited);
    }

    #[test]
    fn test_blocked_receiver_gets_late_message() {
        let (k, reg, id) = setup(2, 16, CnxOptions::empty());
        thread::scope(|s| {
            let h = s.spawn(|| {
                let mut buf = [0u8; 16];
                let got = k
                    .run_as_world(SERVER, || {
                        get_one(&reg, id, RpcFlags::CAN_BLOCK, 0, &mut buf)
                    })
                    .unwrap();
                (got.1, buf[..got.2 as usize].to_vec())
            });
            thread::sleep(Duration::from_millis(30));
            send_bytes(&k, &reg, id, 9, RpcFlags::empty(), b"late").unwrap();
            let (function, payload) = h.join().unwrap();
            assert_eq!(function, 9);
            assert_eq!(payload, b"late");
        });
    }

    #[test]
    fn test_unregister_wakes_blocked_receiver() {
        let (k, reg, id) = setup(1, 8, CnxOptions::empty());
        thread::scope(|s| {
            let h = s.spawn(|| {
                let mut buf = [0u8; 8];
                let start = Instant::now();
                let res = k.run_as_world(SERVER, || {
                    get_one(&reg, id, RpcFlags::CAN_BLOCK, 0, &mut buf)
                });
                (res, start.elapsed())
            });
            thread::sleep(Duration::from_millis(30));
            reg.unregister(id, None).unwrap();
            let (res, waited) = h.join().unwrap();
            assert_eq!(res.err(), Some(RpcError::Disconnected));
            // The receiver was still blocked when teardown began.
            assert!(waited >= Duration::from_millis(25), "woke at {:?}", waited);
        });
        assert_eq!(reg.connect("test.rpc"), Err(RpcError::NotFound));
    }

    #[test]
    fn test_small_buffer_leaves_message_queued() {
        let (k, reg, id) = setup(2, 16, CnxOptions::empty());
        send_bytes(&k, &reg, id, 1, RpcFlags::empty(), b"12345678").unwrap();
        let mut small = [0u8; 4];
        assert_eq!(
            get_one(&reg, id, RpcFlags::empty(), 0, &mut small),
            Err(RpcError::NoResources)
        );
        // Still queued; a big enough buffer drains it.
        let mut big = [0u8; 16];
        let (_, _, len, _) = get_one(&reg, id, RpcFlags::empty(), 0, &mut big).unwrap();
        assert_eq!(&big[..len as usize], b"12345678");
    }

    #[test]
    fn test_small_buffer_leaves_reply_queued() {
        let (k, reg, id) = setup(2, 16, CnxOptions::empty());
        post_bytes(&k, &reg, id, 5, b"12345678").unwrap();
        let mut small = [0u8; 4];
        assert_eq!(
            get_reply_bytes(&k, &reg, id, 5, RpcFlags::empty(), &mut small),
            Err(RpcError::NoResources)
        );
        let mut big = [0u8; 16];
        let n = get_reply_bytes(&k, &reg, id, 5, RpcFlags::empty(), &mut big).unwrap();
        assert_eq!(&big[..n as usize], b"12345678");
    }

    #[test]
    fn test_send_truncates_long_payloads() {
        let (k, reg, id) = setup(2, RPC_MAX_MSG_LENGTH, CnxOptions::empty());
        let payload = vec![0xab_u8; 600];
        send_bytes(&k, &reg, id, 1, RpcFlags::empty(), &payload).unwrap();
        let mut buf = [0u8; RPC_MAX_MSG_LENGTH as usize];
        let (_, _, len, _) = get_one(&reg, id, RpcFlags::empty(), 0, &mut buf).unwrap();
        assert_eq!(len, RPC_MAX_MSG_LENGTH);
        assert!(buf.iter().all(|b| *b == 0xab));
    }

    #[test]
    fn test_pool_exhaustion_recovers() {
        let (k, reg, id) = setup(2, 16, CnxOptions::empty());
        send_bytes(&k, &reg, id, 1, RpcFlags::empty(), b"a").unwrap();
        send_bytes(&k, &reg, id, 2, RpcFlags::empty(), b"b").unwrap();
        assert_eq!(
            send_bytes(&k, &reg, id, 3, RpcFlags::empty(), b"c"),
            Err(RpcError::LimitExceeded)
        );
        let mut buf = [0u8; 16];
        get_one(&reg, id, RpcFlags::empty(), 0, &mut buf).unwrap();
        send_bytes(&k, &reg, id, 3, RpcFlags::empty(), b"c").unwrap();
    }

    #[test]
    fn test_send_copy_fault_returns_buffer_to_pool() {
        let (k, reg, id) = setup(2, 16, CnxOptions::empty());
        k.fail_next_copies(1);
        let res = send_bytes(&k, &reg, id, 1, RpcFlags::empty(), b"doomed");
        assert!(matches!(res, Err(RpcError::CopyFault(_))));
        // Both buffers are still usable.
        send_bytes(&k, &reg, id, 1, RpcFlags::empty(), b"a").unwrap();
        send_bytes(&k, &reg, id, 2, RpcFlags::empty(), b"b").unwrap();
    }

    #[test]
    fn test_get_msg_info_copy_fault() {
        let (k, reg, id) = setup(2, 16, CnxOptions::empty());
        send_bytes(&k, &reg, id, 1, RpcFlags::empty(), b"x").unwrap();
        let mut buf = [0u8; 16];
        k.fail_next_copies(1);
        // The descriptor read itself faults, before the queue is
        // touched.
        let res = get_one(&reg, id, RpcFlags::empty(), 0, &mut buf);
        assert!(matches!(res, Err(RpcError::CopyFault(_))));
        get_one(&reg, id, RpcFlags::empty(), 0, &mut buf).unwrap();
    }

    #[test]
    fn test_get_reply_fault_requeues_at_front() {
        let (k, reg, id) = setup(4, 16, CnxOptions::empty());
        post_bytes(&k, &reg, id, 7, b"seven").unwrap();
        post_bytes(&k, &reg, id, 9, b"nine").unwrap();
        let mut out = [0u8; 16];
        k.fail_next_copies(1);
        let res = get_reply_bytes(&k, &reg, id, 9, RpcFlags::empty(), &mut out);
        assert!(matches!(res, Err(RpcError::CopyFault(_))));
        // The failed reply sits at the front now, ahead of token 7.
        let locked = reg.find_and_lock(id).unwrap();
        assert_eq!(locked.state().replies.front().map(|m| m.token), Some(9));
        reg.release_and_unlock(locked);
        // Retries still land by token.
        let n = get_reply_bytes(&k, &reg, id, 9, RpcFlags::empty(), &mut out).unwrap();
        assert_eq!(&out[..n as usize], b"nine");
        let n = get_reply_bytes(&k, &reg, id, 7, RpcFlags::empty(), &mut out).unwrap();
        assert_eq!(&out[..n as usize], b"seven");
    }

    #[test]
    fn test_get_msg_rejects_null_buffer() {
        let (_k, reg, id) = setup(1, 8, CnxOptions::empty());
        let mut info = MsgInfo {
            token: RPC_TOKEN_INVALID,
            function: 0,
            data: VmAddr::NULL,
            data_len: 0,
            world: WorldId::INVALID,
        };
        assert_eq!(
            reg.get_msg(
                id,
                RpcFlags::empty(),
                VmAddr::from_mut(&mut info),
                0,
                BufferKind::Kernel,
                None,
            ),
            Err(RpcError::BadParam)
        );
    }

    #[test]
    fn test_forced_token_and_plain_send() {
        let (k, reg, id) = setup(4, 16, CnxOptions::empty());
        let t = k.run_as_world(CLIENT, || {
            reg.send(
                id,
                1,
                RpcFlags::FORCE_TOKEN,
                1234,
                VmAddr(b"x".as_ptr() as usize),
                1,
                BufferKind::Kernel,
            )
        });
        assert_eq!(t, Ok(1234));
        // Without REPLY_EXPECTED or FORCE_TOKEN there is no token.
        let t = send_bytes(&k, &reg, id, 1, RpcFlags::empty(), b"y").unwrap();
        assert_eq!(t, RPC_TOKEN_INVALID);
    }

    #[test]
    fn test_interruptible_get_msg_breaks_out() {
        let (k, reg, id) = setup(1, 8, CnxOptions::empty());
        thread::scope(|s| {
            let h = s.spawn(|| {
                let mut buf = [0u8; 8];
                let mut info = MsgInfo {
                    token: RPC_TOKEN_INVALID,
                    function: 0,
                    data: VmAddr(buf.as_mut_ptr() as usize),
                    data_len: buf.len() as u32,
                    world: WorldId::INVALID,
                };
                k.run_as_world(SERVER, || {
                    reg.get_msg_interruptible(
                        id,
                        RpcFlags::CAN_BLOCK,
                        VmAddr::from_mut(&mut info),
                        0,
                        BufferKind::Kernel,
                        None,
                    )
                })
            });
            thread::sleep(Duration::from_millis(30));
            k.interrupt_world(SERVER);
            assert_eq!(h.join().unwrap(), Err(RpcError::WaitInterrupted));
        });
    }

    #[test]
    fn test_interruptible_get_msg_returns_after_spurious_wake() {
        let (k, reg, id) = setup(1, 8, CnxOptions::empty());
        thread::scope(|s| {
            let h = s.spawn(|| {
                let mut buf = [0u8; 8];
                let mut info = MsgInfo {
                    token: RPC_TOKEN_INVALID,
                    function: 0,
                    data: VmAddr(buf.as_mut_ptr() as usize),
                    data_len: buf.len() as u32,
                    world: WorldId::INVALID,
                };
                k.run_as_world(SERVER, || {
                    reg.get_msg_interruptible(
                        id,
                        RpcFlags::CAN_BLOCK,
                        VmAddr::from_mut(&mut info),
                        0,
                        BufferKind::Kernel,
                        None,
                    )
                })
            });
            // A wakeup that delivers no message still ends the wait.
            thread::sleep(Duration::from_millis(30));
            reg.stress_wakeup();
            assert_eq!(h.join().unwrap(), Err(RpcError::WaitInterrupted));
        });
    }

    #[test]
    fn test_plain_get_msg_shrugs_off_interrupts() {
        let (k, reg, id) = setup(2, 16, CnxOptions::empty());
        thread::scope(|s| {
            let h = s.spawn(|| {
                let mut buf = [0u8; 16];
                k.run_as_world(SERVER, || {
                    get_one(&reg, id, RpcFlags::CAN_BLOCK, 0, &mut buf)
                })
                .map(|got| got.1)
            });
            thread::sleep(Duration::from_millis(20));
            // Neither an interrupt nor a stray wakeup ends the wait.
            k.interrupt_world(SERVER);
            thread::sleep(Duration::from_millis(20));
            reg.stress_wakeup();
            thread::sleep(Duration::from_millis(20));
            send_bytes(&k, &reg, id, 11, RpcFlags::empty(), b"real").unwrap();
            assert_eq!(h.join().unwrap(), Ok(11));
        });
    }

    #[test]
    fn test_semaphore_wait_breaks_on_action() {
        let (k, reg, id) = setup(1, 8, CnxOptions::SEMAPHORE);
        k.set_world_actions(SERVER, ActionMask(0b10));
        thread::scope(|s| {
            let h = s.spawn(|| {
                let mut buf = [0u8; 8];
                let mut info = MsgInfo {
                    token: RPC_TOKEN_INVALID,
                    function: 0,
                    data: VmAddr(buf.as_mut_ptr() as usize),
                    data_len: buf.len() as u32,
                    world: WorldId::INVALID,
                };
                k.run_as_world(SERVER, || {
                    reg.get_msg_interruptible(
                        id,
                        RpcFlags::CAN_BLOCK,
                        VmAddr::from_mut(&mut info),
                        0,
                        BufferKind::Kernel,
                        None,
                    )
                })
            });
            thread::sleep(Duration::from_millis(30));
            k.post_action(SERVER, ActionMask(0b10));
            assert_eq!(h.join().unwrap(), Err(RpcError::WaitInterrupted));
        });
    }

    #[test]
    fn test_get_reply_allow_interruptions_waits_once() {
        let (k, reg, id) = setup(1, 8, CnxOptions::empty());
        thread::scope(|s| {
            let h = s.spawn(|| {
                let mut out = [0u8; 8];
                get_reply_bytes(
                    &k,
                    &reg,
                    id,
                    77,
                    RpcFlags::CAN_BLOCK | RpcFlags::ALLOW_INTERRUPTIONS,
                    &mut out,
                )
            });
            thread::sleep(Duration::from_millis(30));
            // Any wakeup that brings no reply ends the wait.
            reg.stress_wakeup();
            assert_eq!(h.join().unwrap(), Err(RpcError::WaitInterrupted));
        });
    }

    #[test]
    fn test_reply_wait_class_follows_connection() {
        let (k, reg, id) = setup(1, 8, CnxOptions::SEMAPHORE);
        let plain = reg
            .register("test.plain", CnxOptions::empty(), SERVER, 1, 8)
            .unwrap();
        // A reply waiter on a semaphore connection is tagged as a
        // semaphore wait, like every other waiter on it.
        thread::scope(|s| {
            let h = s.spawn(|| {
                let mut out = [0u8; 8];
                get_reply_bytes(&k, &reg, id, 42, RpcFlags::CAN_BLOCK, &mut out)
            });
            thread::sleep(Duration::from_millis(30));
            assert_eq!(k.waiter_class(CLIENT), Some(WaitClass::Semaphore));
            post_bytes(&k, &reg, id, 42, b"r").unwrap();
            assert_eq!(h.join().unwrap(), Ok(1));
        });
        thread::scope(|s| {
            let h = s.spawn(|| {
                let mut out = [0u8; 8];
                get_reply_bytes(&k, &reg, plain, 7, RpcFlags::CAN_BLOCK, &mut out)
            });
            thread::sleep(Duration::from_millis(30));
            assert_eq!(k.waiter_class(CLIENT), Some(WaitClass::Rpc));
            post_bytes(&k, &reg, plain, 7, b"rr").unwrap();
            assert_eq!(h.join().unwrap(), Ok(2));
        });
    }

    #[test]
    fn test_poll_readiness_and_interest_check() {
        let (k, reg, id) = setup(2, 16, CnxOptions::empty());
        let polled = k.run_as_world(SERVER, || reg.poll(id, PollEvents::GET_MSG, false));
        assert_eq!(polled, Err(RpcError::WouldBlock));
        assert_eq!(
            k.run_as_world(SERVER, || reg.poll(id, PollEvents::GET_REPLY, false)),
            Err(RpcError::BadParam)
        );
        assert_eq!(
            k.run_as_world(SERVER, || reg.poll(id, PollEvents::empty(), false)),
            Ok(PollEvents::empty())
        );
        send_bytes(&k, &reg, id, 1, RpcFlags::empty(), b"m").unwrap();
        assert_eq!(
            k.run_as_world(SERVER, || reg.poll(id, PollEvents::GET_MSG, false)),
            Ok(PollEvents::GET_MSG)
        );
        // Cleanup works on a live connection and fails the lookup on
        // an id that never resolved.
        assert_eq!(k.run_as_world(SERVER, || reg.poll_cleanup(id)), Ok(()));
        assert_eq!(
            k.run_as_world(SERVER, || reg.poll_cleanup(RpcCnxId(4099))),
            Err(RpcError::NotFound)
        );
    }

    #[test]
    fn test_poll_notify_wakes_on_send() {
        let (k, reg, id) = setup(2, 16, CnxOptions::empty());
        thread::scope(|s| {
            let h = s.spawn(|| {
                k.run_as_world(SERVER, || {
                    let chan = WaitChannel::world_poll(SERVER);
                    k.assert_wait(chan, WaitClass::Rpc, ActionMask::NONE);
                    match reg.poll(id, PollEvents::GET_MSG, true) {
                        Ok(ready) => ready,
                        Err(_) => {
                            let _ = k.block(None);
                            reg.poll(id, PollEvents::GET_MSG, false).unwrap()
                        }
                    }
                })
            });
            thread::sleep(Duration::from_millis(30));
            send_bytes(&k, &reg, id, 1, RpcFlags::empty(), b"m").unwrap();
            assert_eq!(h.join().unwrap(), PollEvents::GET_MSG);
        });
    }

    #[test]
    fn test_host_doorbell_rings_on_send_only() {
        let (k, reg, id) = setup(2, 16, CnxOptions::NOTIFY_HOST);
        assert_eq!(k.doorbell_count(), 0);
        let t = send_bytes(&k, &reg, id, 1, RpcFlags::REPLY_EXPECTED, b"m").unwrap();
        assert_eq!(k.doorbell_count(), 1);
        let mut buf = [0u8; 16];
        get_one(&reg, id, RpcFlags::empty(), 0, &mut buf).unwrap();
        post_bytes(&k, &reg, id, t, b"r").unwrap();
        // Replies never ring the doorbell.
        assert_eq!(k.doorbell_count(), 1);
    }

    #[test]
    fn test_pending_summary_tracks_message_queue() {
        let (k, reg, id) = setup(4, 16, CnxOptions::empty());
        let idx = id.slot_index(reg.capacity());
        assert!(!reg.check_pending_msgs().is_set(idx));
        send_bytes(&k, &reg, id, 1, RpcFlags::empty(), b"a").unwrap();
        send_bytes(&k, &reg, id, 2, RpcFlags::empty(), b"b").unwrap();
        assert!(reg.check_pending_msgs().is_set(idx));
        let mut buf = [0u8; 16];
        get_one(&reg, id, RpcFlags::empty(), 0, &mut buf).unwrap();
        // One message left; the bit stays.
        assert!(reg.check_pending_msgs().is_set(idx));
        get_one(&reg, id, RpcFlags::empty(), 0, &mut buf).unwrap();
        assert!(!reg.check_pending_msgs().is_set(idx));
        // Replies never set the bit.
        post_bytes(&k, &reg, id, 3, b"r").unwrap();
        assert!(!reg.check_pending_msgs().is_set(idx));
    }

    #[test]
    fn test_call_round_trip_records_latency() {
        let (k, reg, id) = setup(4, 64, CnxOptions::empty());
        thread::scope(|s| {
            s.spawn(|| serve_n(&k, &reg, id, 1));
            let mut out = [0u8; 64];
            let n = k
                .run_as_world(CLIENT, || reg.call(id, 312, None, b"ping", &mut out))
                .unwrap();
            assert_eq!(&out[..n], b"gnip");
        });
        let (cnt, max, tot) = reg.user_stats_row(CLIENT, 312).unwrap();
        assert_eq!(cnt, 1);
        assert!(max <= tot);
        assert!(reg.user_stats_report(CLIENT).unwrap().contains("312"));

        reg.stats_control(CLIENT, "reset").unwrap();
        assert_eq!(reg.user_stats_row(CLIENT, 312), Ok((0, 0, 0)));
        assert_eq!(
            reg.stats_control(CLIENT, "bogus"),
            Err(RpcError::BadParam)
        );
        assert_eq!(
            reg.stats_control(WorldId(9), "reset"),
            Err(RpcError::NotFound)
        );
    }

    #[test]
    fn test_stats_window_gates_recording() {
        let (k, reg, id) = setup(4, 64, CnxOptions::empty());
        reg.stats_disable();
        thread::scope(|s| {
            s.spawn(|| serve_n(&k, &reg, id, 2));
            let mut out = [0u8; 64];
            k.run_as_world(CLIENT, || reg.call(id, 305, None, b"a", &mut out))
                .unwrap();
            reg.stats_enable();
            k.run_as_world(CLIENT, || reg.call(id, 305, None, b"b", &mut out))
                .unwrap();
        });
        let (cnt, _, _) = reg.user_stats_row(CLIENT, 305).unwrap();
        assert_eq!(cnt, 1);
    }

    #[test]
    fn test_operations_on_stale_id() {
        let (k, reg, id) = setup(2, 16, CnxOptions::empty());
        reg.unregister(id, None).unwrap();
        assert_eq!(
            send_bytes(&k, &reg, id, 1, RpcFlags::empty(), b"x"),
            Err(RpcError::NotFound)
        );
        let mut buf = [0u8; 16];
        assert_eq!(
            get_one(&reg, id, RpcFlags::empty(), 0, &mut buf),
            Err(RpcError::NotFound)
        );
        let mut out = [0u8; 16];
        assert_eq!(
            get_reply_bytes(&k, &reg, id, 1, RpcFlags::empty(), &mut out),
            Err(RpcError::NotFound)
        );
        assert_eq!(
            reg.poll(id, PollEvents::GET_MSG, false),
            Err(RpcError::NotFound)
        );
        assert_eq!(
            k.run_as_world(SERVER, || reg.poll_cleanup(id)),
            Err(RpcError::NotFound)
        );
    }
}
