//! The resource tree the merge engine works on: models, instances, samples,
//! their data, labels, tags and descriptors.
//!
//! Creating a model or instance auto-grants the essential `owner` role of
//! that scope to the creator.

use std::sync::Arc;

use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::AppError;
use crate::ledger::grant_in;
use crate::middleware::rbac::require_in;
use crate::models::access::{AccessGrant, ScopeRef};
use crate::models::catalog::{
    Descriptor, Instance, Model, Sample, SampleData, SampleLabel, SampleTag, Tag,
};
use crate::models::role::{Capability, GeneralCapability, InstanceCapability, ModelCapability};
use crate::store::blob::BlobStore;
use crate::store::{Store, Tx};

/// Name of the role granted to the creator of a model or instance.
pub const OWNER_ROLE: &str = "owner";

const SEE_MODEL: Capability = Capability::Model(ModelCapability::CanSee);
const SEE_INSTANCE: Capability = Capability::Instance(InstanceCapability::CanSee);

pub struct Catalog {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
}

impl Catalog {
    pub fn new(store: Arc<dyn Store>, blobs: Arc<dyn BlobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            blobs,
            clock,
        }
    }

    // -- Models --

    pub async fn create_model(
        &self,
        actor: Uuid,
        name: &str,
        description: &str,
    ) -> Result<Model, AppError> {
        let mut tx = self.store.begin().await?;
        require_in(
            tx.as_mut(),
            actor,
            ScopeRef::General,
            &[GeneralCapability::EditModels.into()],
        )
        .await?;

        let model = Model {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.to_string(),
            finalized: false,
            created_at: self.clock.now(),
        };
        tx.insert_model(&model).await?;
        grant_owner_in(tx.as_mut(), actor, ScopeRef::Model(model.id)).await?;
        tx.commit().await?;

        tracing::info!(model_id = %model.id, actor = %actor, "model created");
        Ok(model)
    }

    pub async fn get_model(&self, actor: Uuid, model_id: Uuid) -> Result<Model, AppError> {
        let mut tx = self.store.begin().await?;
        model_in(tx.as_mut(), actor, model_id, &[SEE_MODEL]).await
    }

    pub async fn finalize_model(&self, actor: Uuid, model_id: Uuid) -> Result<Model, AppError> {
        let mut tx = self.store.begin().await?;
        let mut model = model_in(
            tx.as_mut(),
            actor,
            model_id,
            &[SEE_MODEL, ModelCapability::Edit.into()],
        )
        .await?;

        if !model.finalized {
            model.finalized = true;
            tx.update_model(&model).await?;
            tx.commit().await?;
            tracing::info!(model_id = %model.id, "model finalized");
        }
        Ok(model)
    }

    // -- Instances --

    /// Instantiate a finalized model.
    pub async fn create_instance(
        &self,
        actor: Uuid,
        model_id: Uuid,
        name: &str,
        description: &str,
    ) -> Result<Instance, AppError> {
        let mut tx = self.store.begin().await?;
        let model = model_in(
            tx.as_mut(),
            actor,
            model_id,
            &[SEE_MODEL, ModelCapability::Instantiate.into()],
        )
        .await?;
        if !model.finalized {
            return Err(AppError::BadRequest("model not finalized".into()));
        }

        let instance = Instance {
            id: Uuid::new_v4(),
            model_id: model.id,
            name: name.to_string(),
            description: description.to_string(),
            finalized: false,
            merged_into: None,
            last_modified: self.clock.now(),
        };
        tx.insert_instance(&instance).await?;
        grant_owner_in(tx.as_mut(), actor, ScopeRef::Instance(instance.id)).await?;
        tx.commit().await?;

        tracing::info!(instance_id = %instance.id, model_id = %model.id, actor = %actor, "instance created");
        Ok(instance)
    }

    pub async fn get_instance(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
    ) -> Result<Instance, AppError> {
        let mut tx = self.store.begin().await?;
        instance_in(tx.as_mut(), actor, model_id, instance_id, &[SEE_INSTANCE]).await
    }

    pub async fn finalize_instance(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
    ) -> Result<Instance, AppError> {
        let mut tx = self.store.begin().await?;
        let mut instance = instance_in(
            tx.as_mut(),
            actor,
            model_id,
            instance_id,
            &[SEE_INSTANCE, InstanceCapability::Edit.into()],
        )
        .await?;

        if !instance.finalized {
            instance.finalized = true;
            instance.last_modified = self.clock.now();
            tx.update_instance(&instance).await?;
            tx.commit().await?;
            tracing::info!(instance_id = %instance.id, "instance finalized");
        }
        Ok(instance)
    }

    /// Descriptors can only be added while the instance is not finalized.
    pub async fn add_descriptor(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
        key: &str,
        content: Option<Vec<u8>>,
    ) -> Result<Descriptor, AppError> {
        let mut tx = self.store.begin().await?;
        let instance = instance_in(
            tx.as_mut(),
            actor,
            model_id,
            instance_id,
            &[SEE_INSTANCE, InstanceCapability::Edit.into()],
        )
        .await?;
        if instance.finalized {
            return Err(AppError::BadRequest("instance is finalized".into()));
        }

        let file = self.store_blob(content).await?;
        let descriptor = Descriptor {
            id: Uuid::new_v4(),
            instance_id: instance.id,
            key: key.to_string(),
            file: file.clone(),
        };

        let result = async {
            tx.insert_descriptor(&descriptor).await?;
            tx.commit().await
        }
        .await;
        if let Err(e) = result {
            self.discard_blob(file).await;
            return Err(e.into());
        }
        Ok(descriptor)
    }

    pub async fn list_descriptors(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
    ) -> Result<Vec<Descriptor>, AppError> {
        let mut tx = self.store.begin().await?;
        instance_in(tx.as_mut(), actor, model_id, instance_id, &[SEE_INSTANCE]).await?;
        Ok(tx.list_descriptors(instance_id).await?)
    }

    // -- Samples --

    pub async fn add_sample(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
    ) -> Result<Sample, AppError> {
        let mut tx = self.store.begin().await?;
        let instance = instance_in(
            tx.as_mut(),
            actor,
            model_id,
            instance_id,
            &[SEE_INSTANCE, InstanceCapability::AddSample.into()],
        )
        .await?;

        let sample = Sample {
            id: Uuid::new_v4(),
            instance_id: instance.id,
            finalized: false,
            last_modified: self.clock.now(),
        };
        tx.insert_sample(&sample).await?;
        tx.commit().await?;
        Ok(sample)
    }

    pub async fn list_samples(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
    ) -> Result<Vec<Sample>, AppError> {
        let mut tx = self.store.begin().await?;
        instance_in(tx.as_mut(), actor, model_id, instance_id, &[SEE_INSTANCE]).await?;
        Ok(tx.list_samples(instance_id).await?)
    }

    pub async fn finalize_sample(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
        sample_id: Uuid,
    ) -> Result<Sample, AppError> {
        let mut tx = self.store.begin().await?;
        let mut sample = sample_in(
            tx.as_mut(),
            actor,
            model_id,
            instance_id,
            sample_id,
            &[SEE_INSTANCE, InstanceCapability::AddSample.into()],
        )
        .await?;

        if !sample.finalized {
            sample.finalized = true;
            sample.last_modified = self.clock.now();
            tx.update_sample(&sample).await?;
            tx.commit().await?;
        }
        Ok(sample)
    }

    pub async fn add_sample_data(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
        sample_id: Uuid,
        key: &str,
        content: Option<Vec<u8>>,
    ) -> Result<SampleData, AppError> {
        let mut tx = self.store.begin().await?;
        let sample = sample_in(
            tx.as_mut(),
            actor,
            model_id,
            instance_id,
            sample_id,
            &[SEE_INSTANCE, InstanceCapability::AddSample.into()],
        )
        .await?;
        if sample.finalized {
            return Err(AppError::BadRequest("sample is finalized".into()));
        }

        let file = self.store_blob(content).await?;
        let data = SampleData {
            id: Uuid::new_v4(),
            sample_id: sample.id,
            key: key.to_string(),
            file: file.clone(),
        };

        let result = async {
            tx.insert_sample_data(&data).await?;
            tx.commit().await
        }
        .await;
        if let Err(e) = result {
            self.discard_blob(file).await;
            return Err(e.into());
        }
        Ok(data)
    }

    /// Labels on a finalized sample are not mergeable.
    pub async fn add_label(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
        sample_id: Uuid,
        key: &str,
        content: Option<Vec<u8>>,
    ) -> Result<SampleLabel, AppError> {
        let mut tx = self.store.begin().await?;
        let sample = sample_in(
            tx.as_mut(),
            actor,
            model_id,
            instance_id,
            sample_id,
            &[SEE_INSTANCE, InstanceCapability::ResponseLabel.into()],
        )
        .await?;

        let file = self.store_blob(content).await?;
        let label = SampleLabel {
            id: Uuid::new_v4(),
            sample_id: sample.id,
            key: key.to_string(),
            file: file.clone(),
            mergeable: !sample.finalized,
        };

        let result = async {
            tx.insert_label(&label).await?;
            tx.commit().await
        }
        .await;
        if let Err(e) = result {
            self.discard_blob(file).await;
            return Err(e.into());
        }
        Ok(label)
    }

    pub async fn list_labels(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
        sample_id: Uuid,
    ) -> Result<Vec<SampleLabel>, AppError> {
        let mut tx = self.store.begin().await?;
        sample_in(tx.as_mut(), actor, model_id, instance_id, sample_id, &[SEE_INSTANCE]).await?;
        Ok(tx.list_labels(sample_id).await?)
    }

    /// Tag a sample, creating the instance tag on first use. Tags on a
    /// finalized sample are not mergeable.
    pub async fn tag_sample(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
        sample_id: Uuid,
        tag_name: &str,
    ) -> Result<SampleTag, AppError> {
        if tag_name.trim().is_empty() {
            return Err(AppError::BadRequest("tag name must not be empty".into()));
        }

        let mut tx = self.store.begin().await?;
        let sample = sample_in(
            tx.as_mut(),
            actor,
            model_id,
            instance_id,
            sample_id,
            &[SEE_INSTANCE, InstanceCapability::Edit.into()],
        )
        .await?;

        let tag = match tx.get_tag_by_name(instance_id, tag_name).await? {
            Some(tag) => tag,
            None => {
                let tag = Tag {
                    id: Uuid::new_v4(),
                    instance_id,
                    name: tag_name.to_string(),
                };
                tx.insert_tag(&tag).await?;
                tag
            }
        };

        let assoc = SampleTag {
            sample_id: sample.id,
            tag_id: tag.id,
            mergeable: !sample.finalized,
        };
        tx.insert_sample_tag(&assoc).await?;
        tx.commit().await?;
        Ok(assoc)
    }

    pub async fn list_tags(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
    ) -> Result<Vec<Tag>, AppError> {
        let mut tx = self.store.begin().await?;
        instance_in(tx.as_mut(), actor, model_id, instance_id, &[SEE_INSTANCE]).await?;
        Ok(tx.list_tags(instance_id).await?)
    }

    pub async fn list_sample_tags(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
        sample_id: Uuid,
    ) -> Result<Vec<SampleTag>, AppError> {
        let mut tx = self.store.begin().await?;
        sample_in(tx.as_mut(), actor, model_id, instance_id, sample_id, &[SEE_INSTANCE]).await?;
        Ok(tx.list_sample_tags(sample_id).await?)
    }

    pub async fn list_sample_data(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
        sample_id: Uuid,
    ) -> Result<Vec<SampleData>, AppError> {
        let mut tx = self.store.begin().await?;
        sample_in(tx.as_mut(), actor, model_id, instance_id, sample_id, &[SEE_INSTANCE]).await?;
        Ok(tx.list_sample_data(sample_id).await?)
    }

    // -- Blobs --

    /// File content of one descriptor, `None` for a file-less entry.
    pub async fn descriptor_file(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
        descriptor_id: Uuid,
    ) -> Result<Option<Vec<u8>>, AppError> {
        let handle = {
            let mut tx = self.store.begin().await?;
            instance_in(tx.as_mut(), actor, model_id, instance_id, &[SEE_INSTANCE]).await?;
            tx.list_descriptors(instance_id)
                .await?
                .into_iter()
                .find(|d| d.id == descriptor_id)
                .ok_or_else(|| AppError::NotFound(format!("descriptor {}", descriptor_id)))?
                .file
        };
        self.read_blob(handle).await
    }

    /// File content of one sample data entry. Needs `get_training_data`.
    pub async fn sample_data_file(
        &self,
        actor: Uuid,
        model_id: Uuid,
        instance_id: Uuid,
        sample_id: Uuid,
        data_id: Uuid,
    ) -> Result<Option<Vec<u8>>, AppError> {
        let handle = {
            let mut tx = self.store.begin().await?;
            sample_in(
                tx.as_mut(),
                actor,
                model_id,
                instance_id,
                sample_id,
                &[SEE_INSTANCE, InstanceCapability::GetTrainingData.into()],
            )
            .await?;
            tx.list_sample_data(sample_id)
                .await?
                .into_iter()
                .find(|d| d.id == data_id)
                .ok_or_else(|| AppError::NotFound(format!("sample data {}", data_id)))?
                .file
        };
        self.read_blob(handle).await
    }

    async fn read_blob(&self, handle: Option<String>) -> Result<Option<Vec<u8>>, AppError> {
        match handle {
            Some(handle) => Ok(Some(self.blobs.get(&handle).await?)),
            None => Ok(None),
        }
    }

    async fn store_blob(&self, content: Option<Vec<u8>>) -> Result<Option<String>, AppError> {
        match content {
            Some(bytes) => Ok(Some(self.blobs.put(bytes).await?)),
            None => Ok(None),
        }
    }

    async fn discard_blob(&self, handle: Option<String>) {
        if let Some(handle) = handle {
            if let Err(e) = self.blobs.delete(&handle).await {
                tracing::warn!(handle = %handle, "failed to discard blob: {}", e);
            }
        }
    }
}

/// Grant the scope's `owner` role to `user_id`.
async fn grant_owner_in(
    tx: &mut dyn Tx,
    user_id: Uuid,
    scope: ScopeRef,
) -> Result<AccessGrant, AppError> {
    let owner = tx
        .get_role_by_name(scope.scope(), OWNER_ROLE)
        .await?
        .ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!(
                "{} role '{}' is missing, run bootstrap",
                scope.scope(),
                OWNER_ROLE
            ))
        })?;
    grant_in(tx, owner.id, scope, user_id).await
}

/// Load a model the actor holds `required` on.
pub async fn model_in(
    tx: &mut dyn Tx,
    actor: Uuid,
    model_id: Uuid,
    required: &[Capability],
) -> Result<Model, AppError> {
    let model = tx
        .get_model(model_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("model {}", model_id)))?;
    require_in(tx, actor, ScopeRef::Model(model.id), required).await?;
    Ok(model)
}

/// Load an instance of `model_id` the actor can see the model of and holds
/// `required` on.
pub async fn instance_in(
    tx: &mut dyn Tx,
    actor: Uuid,
    model_id: Uuid,
    instance_id: Uuid,
    required: &[Capability],
) -> Result<Instance, AppError> {
    model_in(tx, actor, model_id, &[SEE_MODEL]).await?;
    let instance = tx
        .get_instance(instance_id)
        .await?
        .filter(|i| i.model_id == model_id)
        .ok_or_else(|| AppError::NotFound(format!("instance {}", instance_id)))?;
    require_in(tx, actor, ScopeRef::Instance(instance.id), required).await?;
    Ok(instance)
}

async fn sample_in(
    tx: &mut dyn Tx,
    actor: Uuid,
    model_id: Uuid,
    instance_id: Uuid,
    sample_id: Uuid,
    required: &[Capability],
) -> Result<Sample, AppError> {
    instance_in(tx, actor, model_id, instance_id, required).await?;
    tx.get_sample(sample_id)
        .await?
        .filter(|s| s.instance_id == instance_id)
        .ok_or_else(|| AppError::NotFound(format!("sample {}", sample_id)))
}

// ── Tests ───────────────────────────────────────────────────────
