use std::{any, fmt, marker::PhantomData, sync::Arc};

use log::debug;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    cluster::{ObjectRef, ObjectStore},
    error::{BackendError, Result},
};

/// A model that can be shipped to remote workers.
///
/// A model is rebuilt remotely from its constructor arguments and then has its mutable state
/// (weights, optimizer state, buffers...) restored into it.
pub trait Model: Sized + 'static {
    /// The arguments needed to construct a fresh instance.
    type Args: Clone + Send + Sync + 'static;

    /// The serializable mutable state of an instance.
    type State: Serialize + DeserializeOwned;

    /// The arguments `from_args` needs to rebuild this model.
    fn reconstruction_args(&self) -> Self::Args;

    /// Builds a fresh instance, its state is restored afterwards.
    fn from_args(args: Self::Args) -> Self;

    /// Snapshot of this model's mutable state.
    fn extract_state(&self) -> Self::State;

    /// Overwrites this model's mutable state.
    fn restore_state(&mut self, state: Self::State) -> Result<()>;

    /// The trainable weights as one flat vector.
    fn weights(&self) -> Vec<f32>;

    /// Overwrites the trainable weights.
    ///
    /// # Errors
    /// `WeightsLengthMismatch` if `weights` doesn't fit this model.
    fn set_weights(&mut self, weights: &[f32]) -> Result<()>;
}

/// A model captured once into shared storage, loadable by any amount of workers.
///
/// State is stored as MessagePack, which keeps every float bit for bit (non-finite ones
/// included). The handle owns its storage entry, it is released when the handle is dropped.
pub struct RemoteModelHandle<M: Model> {
    type_name: &'static str,
    args: M::Args,
    state: ObjectRef,
    store: Arc<dyn ObjectStore>,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> RemoteModelHandle<M> {
    /// Captures the reconstruction recipe of `model` and publishes its state.
    ///
    /// # Args
    /// * `model` - The model to capture.
    /// * `store` - Where the state gets published.
    ///
    /// # Returns
    /// A new handle or `Serialization` if the state can't be serialized.
    pub fn capture(model: &M, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let blob = rmp_serde::to_vec_named(&model.extract_state())?;
        let state = store.put(blob);

        debug!(
            object_id = state.id(), bytes = state.size();
            "captured {}", any::type_name::<M>()
        );

        Ok(Self {
            type_name: any::type_name::<M>(),
            args: model.reconstruction_args(),
            state,
            store,
            _model: PhantomData,
        })
    }

    /// Rebuilds an independent local instance of the captured model.
    ///
    /// # Returns
    /// The model, `HandleExpired` if the state was evicted from storage or
    /// `Serialization` if it can't be decoded.
    pub fn load(&self) -> Result<M> {
        let blob = self
            .store
            .get(&self.state)
            .ok_or(BackendError::HandleExpired {
                object_id: self.state.id(),
            })?;

        let state: M::State = rmp_serde::from_slice(&blob)?;
        let mut model = M::from_args(self.args.clone());
        model.restore_state(state)?;
        Ok(model)
    }

    /// The name of the captured model type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The storage entry holding the captured state.
    pub fn state_ref(&self) -> ObjectRef {
        self.state
    }
}

impl<M: Model> fmt::Debug for RemoteModelHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteModelHandle")
            .field("type_name", &self.type_name)
            .field("state", &self.state)
            .finish()
    }
}

impl<M: Model> Drop for RemoteModelHandle<M> {
    fn drop(&mut self) {
        self.store.release(&self.state);
    }
}
