use super::reconciler::{FleetActions, Submitted};
use super::FleetMember;
use crate::client::{ApiError, CloudApi, DeployRequest, DeployTemplate};
use async_trait::async_trait;
use std::sync::Arc;

/// Fleet actions backed by the provider API
pub struct CloudFleetActions<C: ?Sized> {
    cloud: Arc<C>,
    template: DeployTemplate,
    expunge: bool,
}

impl<C: ?Sized> CloudFleetActions<C> {
    pub fn new(cloud: Arc<C>, template: DeployTemplate) -> Self {
        Self {
            cloud,
            template,
            expunge: true,
        }
    }

    /// Whether destroyed VMs are expunged right away (default: yes)
    pub fn with_expunge(mut self, expunge: bool) -> Self {
        self.expunge = expunge;
        self
    }

    pub fn template(&self) -> &DeployTemplate {
        &self.template
    }
}

#[async_trait]
impl<C> FleetActions for CloudFleetActions<C>
where
    C: CloudApi + ?Sized,
{
    async fn create(&self, name: &str) -> Result<Submitted, ApiError> {
        let request = DeployRequest::new(name, self.template.clone());
        let handle = self.cloud.deploy_virtual_machine(&request).await?;
        Ok(Submitted {
            job_id: handle.jobid,
            id: handle.id,
        })
    }

    async fn destroy(&self, member: &FleetMember) -> Result<Submitted, ApiError> {
        let handle = self
            .cloud
            .destroy_virtual_machine(&member.id, self.expunge)
            .await?;
        Ok(Submitted {
            job_id: handle.jobid,
            id: Some(member.id.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CloudCall, InMemoryCloud};
    use crate::fleet::LifecycleState;

    fn template() -> DeployTemplate {
        DeployTemplate {
            zone_id: "z1".into(),
            template_id: "t1".into(),
            service_offering_id: "small".into(),
            network_ids: vec![],
            keypair: Some("ops".into()),
        }
    }

    #[tokio::test]
    async fn test_create_and_destroy_hit_the_cloud() {
        let cloud = Arc::new(InMemoryCloud::new());
        let actions = CloudFleetActions::new(Arc::clone(&cloud), template());

        let created = actions.create("web-01").await.unwrap();
        assert!(created.id.is_some());

        let id = cloud.seed_vm("web-09", "Running").await;
        let member = FleetMember::new(&id, "web-09", LifecycleState::Running);
        let destroyed = actions.destroy(&member).await.unwrap();
        assert_eq!(destroyed.id.as_deref(), Some(id.as_str()));

        assert_eq!(
            cloud.calls().await,
            vec![
                CloudCall::Deploy {
                    name: "web-01".into()
                },
                CloudCall::Destroy { id },
            ]
        );
    }
}
