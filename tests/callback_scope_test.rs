mod common;

use std::cell::RefCell;
use std::rc::Rc;

use openworkers_runtime_host::engine::closure::ClosureRealm;
use openworkers_runtime_host::{
    AsyncContext, CallbackScope, Environment, ResourceExpectation, RuntimeConfig, ScopeState, Value, make_callback,
};

fn closure_realm(env: &mut Environment) -> &mut ClosureRealm {
    env.realm_mut().as_any_mut().downcast_mut::<ClosureRealm>().unwrap()
}

#[test]
fn test_nested_scopes_keep_async_stack_balanced() {
    let mut env = common::environment(RuntimeConfig::default());
    let resource = env.realm_mut().process_object();

    {
        let mut outer = CallbackScope::for_resource(&mut env, resource.clone(), AsyncContext::new(5, 1));
        assert_eq!(outer.async_hooks().execution_async_id(), 5);

        {
            let inner = CallbackScope::for_resource(&mut outer, resource.clone(), AsyncContext::new(6, 5));
            assert_eq!(inner.callback_scope_depth(), 2);
            assert_eq!(inner.async_hooks().execution_async_id(), 6);
            assert_eq!(inner.async_hooks().trigger_async_id(), 5);
        }

        assert_eq!(outer.callback_scope_depth(), 1);
        assert_eq!(outer.async_hooks().execution_async_id(), 5);
        assert_eq!(outer.close(), ScopeState::ClosedOk);
    }

    assert_eq!(env.callback_scope_depth(), 0);
    assert_eq!(env.async_hooks().stack_depth(), 0);
    env.run_cleanup();
}

#[test]
fn test_microtasks_flush_only_at_outermost_scope() {
    let mut env = common::environment(RuntimeConfig::default());
    let resource = env.realm_mut().process_object();
    let order = Rc::new(RefCell::new(Vec::new()));

    {
        let mut outer = CallbackScope::for_resource(&mut env, resource.clone(), AsyncContext::new(2, 1));

        {
            let mut inner = CallbackScope::for_resource(&mut outer, resource.clone(), AsyncContext::new(3, 2));
            let log = Rc::clone(&order);
            closure_realm(&mut inner).enqueue_microtask(move |_| {
                log.borrow_mut().push("microtask");
                Ok(())
            });
            inner.close();
        }

        assert_eq!(closure_realm(&mut outer).pending_microtasks(), 1);
        order.borrow_mut().push("outer close");
        outer.close();
    }

    assert_eq!(*order.borrow(), vec!["outer close", "microtask"]);
    env.run_cleanup();
}

#[test]
fn test_ticks_run_before_scope_closes() {
    let mut env = common::environment(RuntimeConfig::default());
    let resource = env.realm_mut().process_object();
    let order = Rc::new(RefCell::new(Vec::new()));

    let log = Rc::clone(&order);
    let callback = closure_realm(&mut env).function(move |scope, _| {
        let tick_log = Rc::clone(&log);
        scope.next_tick(move |scope| {
            tick_log.borrow_mut().push("tick");
            let micro_log = Rc::clone(&tick_log);
            scope.enqueue_microtask(move |_| {
                micro_log.borrow_mut().push("microtask");
                Ok(())
            });
            Ok(())
        });
        log.borrow_mut().push("callback");
        Ok(Value::from(1))
    });

    let result = make_callback(&mut env, &resource, &callback, &[], AsyncContext::new(4, 1));

    assert_eq!(result, Some(Value::from(1)));
    assert_eq!(*order.borrow(), vec!["callback", "tick", "microtask"]);
    env.run_cleanup();
}

#[test]
fn test_scope_fails_once_managed_calls_are_disabled() {
    let mut env = common::environment(RuntimeConfig::default());
    let resource = env.realm_mut().process_object();
    let callback = closure_realm(&mut env).function(|_, _| panic!("must not run"));

    env.run_cleanup();
    assert!(!env.can_call_into_js());

    {
        let scope = CallbackScope::for_resource(&mut env, resource.clone(), AsyncContext::new(9, 1));
        assert!(scope.failed());
        assert_eq!(scope.async_hooks().stack_depth(), 0);
    }

    assert_eq!(make_callback(&mut env, &resource, &callback, &[], AsyncContext::new(9, 1)), None);
    assert_eq!(env.callback_scope_depth(), 0);
}

#[test]
fn test_scope_without_resource_when_allowed() {
    let mut env = common::environment(RuntimeConfig::default());

    {
        let mut scope = CallbackScope::new(&mut env, None, AsyncContext::new(1, 0), ResourceExpectation::AllowEmpty);
        assert!(scope.resource().is_none());
        assert_eq!(scope.close(), ScopeState::ClosedOk);
    }

    env.run_cleanup();
}

#[test]
#[should_panic(expected = "callback scope requires a resource object")]
fn test_missing_required_resource_is_fatal() {
    let mut env = common::environment(RuntimeConfig::default());
    let _scope = CallbackScope::new(&mut env, None, AsyncContext::new(1, 0), ResourceExpectation::Require);
}

#[test]
#[should_panic(expected = "corrupted")]
fn test_mismatched_pop_is_fatal() {
    let mut env = common::environment(RuntimeConfig::default());

    env.async_hooks_mut().push_async_ids(5, 1);
    env.async_hooks_mut().pop_async_id(6);
}

/// Small deterministic generator for scope action sequences.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

/// Open a scope, then nest, mark failed, close or drop as `rng` dictates.
fn exercise_scope(env: &mut Environment, rng: &mut Lcg, trigger: u64, depth: usize) {
    let async_id = env.async_hooks_mut().new_async_id();
    let mut scope = CallbackScope::new(env, None, AsyncContext::new(async_id, trigger), ResourceExpectation::AllowEmpty);

    assert_eq!(scope.callback_scope_depth(), depth + 1);
    assert_eq!(scope.async_hooks().stack_depth(), depth + 1);

    for _ in 0..8 {
        match rng.next() % 4 {
            0 if depth < 5 => {
                exercise_scope(&mut scope, rng, async_id, depth + 1);
                assert_eq!(scope.callback_scope_depth(), depth + 1);
                assert_eq!(scope.async_hooks().execution_async_id(), async_id);
            }
            1 => scope.mark_as_failed(),
            2 => {
                let state = scope.close();
                assert_ne!(state, ScopeState::Open);
                assert_eq!(scope.close(), state);
                return;
            }
            3 => return,
            _ => {}
        }
    }
}

#[test]
fn test_generated_scope_sequences_stay_balanced() {
    let mut env = common::environment(RuntimeConfig::default());

    for seed in 0..200 {
        let mut rng = Lcg(seed);
        exercise_scope(&mut env, &mut rng, 0, 0);

        assert_eq!(env.callback_scope_depth(), 0, "seed {}", seed);
        assert_eq!(env.async_hooks().stack_depth(), 0, "seed {}", seed);
        assert_eq!(env.async_hooks().execution_async_id(), 0, "seed {}", seed);
    }

    assert!(!env.is_stopping());
    env.run_cleanup();
}
