// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Layers: recipes that build services into a `Context`.
//!
//! A layer's construction may need other services, acquire scoped
//! resources or fail. Within one build every layer value is constructed
//! at most once, however many dependents share it; `fresh` opts a layer
//! out of that.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::effect::{Data, Effect};
use crate::scope::{erase_exit, Scope};

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(0);

/// Outputs of the layers already built, by layer id.
type Memo = Arc<Mutex<HashMap<u64, Context>>>;

type Make<E> = Arc<dyn Fn(&Memo) -> Effect<Context, E> + Send + Sync>;

pub struct Layer<E = Infallible> {
    id: u64,
    memoized: bool,
    make: Make<E>,
}

impl<E> Clone for Layer<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            memoized: self.memoized,
            make: self.make.clone(),
        }
    }
}

impl<E> fmt::Debug for Layer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.id)
            .field("memoized", &self.memoized)
            .finish()
    }
}

impl<E: Data> Layer<E> {
    fn from_make(make: impl Fn(&Memo) -> Effect<Context, E> + Send + Sync + 'static) -> Self {
        Self {
            id: NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed),
            memoized: true,
            make: Arc::new(make),
        }
    }

    /// A layer holding an already-built service.
    pub fn succeed<S: Clone + Send + Sync + 'static>(service: S) -> Self {
        Layer::from_make(move |_| Effect::succeed(Context::new().with(service.clone())))
    }

    /// A layer holding every service of `context`.
    pub fn from_context(context: Context) -> Self {
        Layer::from_make(move |_| Effect::succeed(context.clone()))
    }

    /// A layer whose service is produced by `effect`. The effect sees the
    /// services of whatever the layer is provided with, and resources it
    /// acquires live as long as the layer's build.
    pub fn effect<S: Clone + Send + Sync + 'static>(effect: &Effect<S, E>) -> Self {
        let effect = effect.clone();
        Layer::from_make(move |_| effect.map(|service| Context::new().with(service)))
    }

    /// Build both layers; the result holds the services of each, `other`
    /// winning on conflict.
    pub fn merge(&self, other: &Layer<E>) -> Self {
        let (left, right) = (self.clone(), other.clone());
        Layer::from_make(move |memo| {
            left.build_in(memo)
                .zip_with(&right.build_in(memo), |l, r| l.merge(&r))
        })
    }

    /// Build this layer with the services of `deps` available. The result
    /// holds only this layer's services.
    pub fn provide(&self, deps: &Layer<E>) -> Self {
        self.provide_with(deps, false)
    }

    /// Like `provide`, but the result keeps the services of `deps` too.
    pub fn provide_merge(&self, deps: &Layer<E>) -> Self {
        self.provide_with(deps, true)
    }

    fn provide_with(&self, deps: &Layer<E>, keep_deps: bool) -> Self {
        let (this, deps) = (self.clone(), deps.clone());
        Layer::from_make(move |memo| {
            let this = this.build_in(memo);
            deps.build_in(memo).flat_map(move |provided| {
                let extra = provided.clone();
                this.with_context(move |ctx| ctx.merge(&extra))
                    .map(move |built| match keep_deps {
                        true => provided.clone().merge(&built),
                        false => built,
                    })
            })
        })
    }

    pub fn map_error<E2: Data>(&self, f: impl Fn(E) -> E2 + Send + Sync + 'static) -> Layer<E2> {
        let this = self.clone();
        let f = Arc::new(f);
        Layer::from_make(move |memo| {
            let f = f.clone();
            this.build_in(memo).map_error(move |e| f(e))
        })
    }

    /// A copy that is constructed anew every time it appears in a build.
    pub fn fresh(&self) -> Self {
        Self {
            memoized: false,
            ..self.clone()
        }
    }

    /// Construct the services. Resources the layers acquire go to the
    /// scope in context.
    pub fn build(&self) -> Effect<Context, E> {
        let this = self.clone();
        Effect::suspend(move || this.build_in(&Memo::default()))
    }

    fn build_in(&self, memo: &Memo) -> Effect<Context, E> {
        let make = self.make.clone();
        let memo = memo.clone();
        let (id, memoized) = (self.id, self.memoized);
        Effect::suspend(move || {
            if memoized {
                if let Some(built) = memo.lock().unwrap().get(&id) {
                    return Effect::succeed(built.clone());
                }
            }
            let store = memo.clone();
            make(&memo).map(move |built| {
                if memoized {
                    store.lock().unwrap().insert(id, built.clone());
                }
                built
            })
        })
    }
}

impl<A: Clone + Send + 'static, E: Data> Effect<A, E> {
    /// Build `layer`, run this effect with its services added, then
    /// release what the layer acquired.
    pub fn provide_layer(&self, layer: &Layer<E>) -> Self {
        let (inner, layer) = (self.clone(), layer.clone());
        Scope::make().flat_map(move |scope| {
            let inner = inner.clone();
            let closing = scope.clone();
            scope
                .extend(&layer.build())
                .flat_map(move |services| inner.with_context(move |ctx| ctx.merge(&services)))
                .on_exit(move |exit| closing.close(erase_exit(exit)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::Ref;
    use crate::runtime::Runtime;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Debug, PartialEq)]
    struct Settings {
        level: &'static str,
        url: &'static str,
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Logger(&'static str);

    #[derive(Clone, Debug, PartialEq)]
    struct Database {
        url: &'static str,
        level: &'static str,
    }

    fn counted_settings(builds: &Arc<AtomicUsize>) -> Layer {
        let builds = builds.clone();
        Layer::effect(&Effect::sync(move || {
            builds.fetch_add(1, Ordering::SeqCst);
            Settings {
                level: "INFO",
                url: "db://local",
            }
        }))
    }

    fn logger() -> Layer {
        Layer::effect(&Effect::<Settings, Infallible>::service().map(|s| Logger(s.level)))
    }

    fn database() -> Layer {
        Layer::effect(
            &Effect::<Settings, Infallible>::service()
                .zip_with(&Effect::<Logger, Infallible>::service(), |s, l| Database {
                    url: s.url,
                    level: l.0,
                }),
        )
    }

    #[test]
    fn shared_dependencies_are_built_once() {
        let rt = Runtime::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let settings = counted_settings(&builds);
        let app = database().provide(&settings.merge(&logger().provide(&settings)));
        let program: Effect<(Database, bool), Infallible> = Effect::<Database, Infallible>::service()
            .zip(&Effect::<Option<Settings>, Infallible>::service_option().map(|s| s.is_some()))
            .provide_layer(&app);
        assert_eq!(
            rt.run_sync(&program),
            Ok((
                Database {
                    url: "db://local",
                    level: "INFO"
                },
                false
            ))
        );
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        rt.run_sync(&program).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn provide_merge_keeps_the_dependencies() {
        let rt = Runtime::new();
        let settings = Layer::succeed(Settings {
            level: "DEBUG",
            url: "db://test",
        });
        let program: Effect<(Logger, Settings), Infallible> = Effect::<Logger, Infallible>::service()
            .zip(&Effect::service())
            .provide_layer(&logger().provide_merge(&settings));
        let (logger, settings) = rt.run_sync(&program).unwrap();
        assert_eq!(logger, Logger("DEBUG"));
        assert_eq!(settings.url, "db://test");
    }

    #[test]
    fn fresh_layers_are_rebuilt() {
        let rt = Runtime::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let settings = counted_settings(&builds);
        let twice = settings.fresh().merge(&settings.fresh());
        rt.run_sync(&twice.build()).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn layer_resources_are_released_after_use() {
        let rt = Runtime::new();
        let log: Ref<Vec<&'static str>> = Ref::new(Vec::new());
        let push = |entry: &'static str| {
            let log = log.clone();
            move || {
                log.update(move |v| {
                    let mut v = v.clone();
                    v.push(entry);
                    v
                })
            }
        };
        let closed = push("closed");
        let connection = Layer::effect(&Effect::acquire_release(
            &Effect::succeed(Logger("conn")),
            move |_, _| closed(),
        ));
        let used = push("used");
        let program: Effect<(), Infallible> = Effect::<Logger, Infallible>::service()
            .flat_map(move |_| used())
            .provide_layer(&connection);
        rt.run_sync(&program).unwrap();
        assert_eq!(log.get_now(), vec!["used", "closed"]);
    }

    #[test]
    fn construction_failures_reach_the_program() {
        let rt = Runtime::new();
        let broken: Layer<String> = Layer::effect(&Effect::<Settings, String>::fail("no settings".to_string()));
        let program: Effect<Settings, usize> = Effect::<Settings, usize>::service()
            .provide_layer(&broken.map_error(|e: String| e.len()));
        assert_eq!(rt.run_sync(&program).unwrap_err().failure(), Some(&11));
    }
}
