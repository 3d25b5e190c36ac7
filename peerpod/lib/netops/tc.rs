use futures::StreamExt;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_REQUEST};
use netlink_packet_route::{
    tc::{TcHandle, TcMessage},
    RouteNetlinkMessage,
};
use tracing::debug;

use crate::{PeerpodError, PeerpodResult};

use super::{link::is_missing, Namespace};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const TC_H_INGRESS: u32 = 0xffff_fff1;

const INGRESS_PARENT: u32 = 0xffff_0000;

const ETH_P_ALL: u16 = 0x0003;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Namespace {
    /// Redirects every packet arriving on `src` to the egress of `dst`.
    ///
    /// Installs an ingress qdisc on `src` and a u32 filter matching all traffic whose single
    /// mirred action steals the packet and redirects it to `dst`.
    pub async fn redirect_add(&self, src: &str, dst: &str) -> PeerpodResult<()> {
        let src_index = *self.link_find(src).await?.get_index();
        let dst_index = *self.link_find(dst).await?.get_index();

        self.handle()
            .qdisc()
            .add(src_index as i32)
            .ingress()
            .execute()
            .await?;

        self.handle()
            .traffic_filter(src_index as i32)
            .add()
            .parent(INGRESS_PARENT)
            .protocol(ETH_P_ALL)
            .redirect(dst_index)?
            .execute()
            .await?;

        debug!(src, dst, ns = %self.path().display(), "added tc redirect");
        Ok(())
    }

    /// Removes the redirect installed on `src` by deleting its ingress qdisc.
    pub async fn redirect_del(&self, src: &str) -> PeerpodResult<()> {
        let src_index = *self.link_find(src).await?.get_index();

        let mut message = TcMessage::with_index(src_index as i32);
        message.header.parent = TcHandle::from(TC_H_INGRESS);

        let mut request = NetlinkMessage::from(RouteNetlinkMessage::DelQueueDiscipline(message));
        request.header.flags = NLM_F_REQUEST | NLM_F_ACK;

        let mut handle = self.handle().clone();
        let mut response = handle.request(request)?;
        while let Some(message) = response.next().await {
            if let NetlinkPayload::Error(e) = message.payload {
                if e.raw_code() == 0 {
                    continue;
                }

                let error = rtnetlink::Error::NetlinkError(e);
                if is_missing(&error) || is_invalid(&error) {
                    return Err(PeerpodError::NotFound(format!(
                        "no ingress qdisc on {src}"
                    )));
                }
                return Err(error.into());
            }
        }

        debug!(src, ns = %self.path().display(), "deleted tc redirect");
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

// The kernel answers EINVAL when deleting an ingress qdisc that was never added.
fn is_invalid(error: &rtnetlink::Error) -> bool {
    crate::error::netlink_errno(error) == Some(libc::EINVAL)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::netops::LinkKind;

    use super::*;

    #[tokio::test]
    async fn test_redirect_del_missing_link_is_not_found() -> anyhow::Result<()> {
        let ns = Namespace::open_current().await?;
        let err = ns.redirect_del("ppnonexistent0").await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    #[ignore = "requires CAP_NET_ADMIN"]
    async fn test_redirect_add_and_del() -> anyhow::Result<()> {
        let name = format!("pptc{}", &uuid::Uuid::new_v4().simple().to_string()[..6]);
        let ns = Namespace::create_named(&name).await?;

        let a = ns
            .link_add("tca0", LinkKind::Veth { peer: "tca1".into(), peer_ns: None })
            .await?;
        a.set_up().await?;

        ns.redirect_add("tca0", "tca1").await?;
        ns.redirect_add("tca1", "tca0").await?;
        ns.redirect_del("tca0").await?;
        ns.redirect_del("tca1").await?;
        assert!(ns.redirect_del("tca0").await.unwrap_err().is_not_found());

        drop(ns);
        Namespace::delete_named(&name)?;
        Ok(())
    }
}
