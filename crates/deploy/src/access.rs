//! Remote access-controller operations.
//!
//! Reads go straight to the ledger. Writes are sent with the deployer's
//! [`TxSequencer`] and awaited to a confirmed receipt.

use alloy_core::primitives::Address;

use crate::capability::{Capability, CapabilityMask};
use crate::error::RemoteError;
use crate::ledger::{Ledger, LedgerCall, TxSequencer};

/// Handle on a deployed access controller.
#[derive(Debug)]
pub struct AccessController<'a, L> {
    ledger: &'a L,
    address: Address,
}

impl<'a, L: Ledger> AccessController<'a, L> {
    pub fn new(ledger: &'a L, address: Address) -> Self {
        Self { ledger, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub async fn current_mask(&self, holder: Address) -> Result<CapabilityMask, RemoteError> {
        self.ledger.role_mask(self.address, holder).await
    }

    pub async fn address_of(&self, flag: Capability) -> Result<Address, RemoteError> {
        self.ledger.address_of(self.address, flag).await
    }

    pub async fn owner(&self) -> Result<Address, RemoteError> {
        self.ledger.owner(self.address).await
    }

    pub async fn grant(
        &self,
        sequencer: &mut TxSequencer,
        holder: Address,
        mask: CapabilityMask,
    ) -> Result<(), RemoteError> {
        sequencer
            .send(
                self.ledger,
                LedgerCall::GrantRoles {
                    controller: self.address,
                    holder,
                    mask,
                },
            )
            .await?;
        tracing::debug!(holder = %holder, mask = %mask, "Roles granted");
        Ok(())
    }

    pub async fn revoke(
        &self,
        sequencer: &mut TxSequencer,
        holder: Address,
        mask: CapabilityMask,
    ) -> Result<(), RemoteError> {
        sequencer
            .send(
                self.ledger,
                LedgerCall::RevokeRoles {
                    controller: self.address,
                    holder,
                    mask,
                },
            )
            .await?;
        tracing::debug!(holder = %holder, mask = %mask, "Roles revoked");
        Ok(())
    }

    pub async fn set_address(
        &self,
        sequencer: &mut TxSequencer,
        flag: Capability,
        target: Address,
    ) -> Result<(), RemoteError> {
        sequencer
            .send(
                self.ledger,
                LedgerCall::SetAddress {
                    controller: self.address,
                    flag,
                    target,
                },
            )
            .await?;
        tracing::debug!(flag = %flag, target = %target, "Address bound");
        Ok(())
    }

    /// Revoke every bit `holder` currently holds and return what was revoked.
    ///
    /// The bits read are added to `observed` before the revoke is sent, so a
    /// caller retrying after a lost receipt still knows what was held.
    pub async fn renounce_all(
        &self,
        sequencer: &mut TxSequencer,
        holder: Address,
        observed: &mut CapabilityMask,
    ) -> Result<CapabilityMask, RemoteError> {
        let held = self.current_mask(holder).await?;
        *observed = *observed | held;
        if !held.is_empty() {
            self.revoke(sequencer, holder, held).await?;
        }
        Ok(held)
    }

    /// Transfer ownership from `from` to `to` if `from` still owns the
    /// controller. Returns the owner afterwards.
    pub async fn hand_over(
        &self,
        sequencer: &mut TxSequencer,
        from: Address,
        to: Address,
    ) -> Result<Address, RemoteError> {
        let owner = self.owner().await?;
        if owner != from || from == to {
            return Ok(owner);
        }
        sequencer
            .send(
                self.ledger,
                LedgerCall::TransferOwnership {
                    controller: self.address,
                    new_owner: to,
                },
            )
            .await?;
        tracing::info!(controller = %self.address, owner = %to, "Controller ownership transferred");
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SimulatedLedger;
    use crate::registry::ComponentKind;

    #[tokio::test]
    async fn test_grant_then_renounce() {
        let deployer = Address::repeat_byte(0x11);
        let ledger = SimulatedLedger::new();
        let mut sequencer = TxSequencer::sync(&ledger, deployer).await.unwrap();
        let receipt = sequencer
            .send(
                &ledger,
                LedgerCall::Create {
                    kind: ComponentKind::AccessController,
                    args: vec![],
                },
            )
            .await
            .unwrap();
        let controller = AccessController::new(&ledger, receipt.contract_address.unwrap());

        let mask = Capability::PoolAdmin.mask() | Capability::RewardMint.mask();
        controller.grant(&mut sequencer, deployer, mask).await.unwrap();
        assert_eq!(controller.current_mask(deployer).await.unwrap(), mask);

        let mut observed = CapabilityMask::EMPTY;
        let revoked = controller
            .renounce_all(&mut sequencer, deployer, &mut observed)
            .await
            .unwrap();
        assert_eq!(revoked, mask);
        assert!(controller.current_mask(deployer).await.unwrap().is_empty());

        // Nothing left, so no further transaction.
        let before = sequencer.next_nonce();
        let revoked = controller
            .renounce_all(&mut sequencer, deployer, &mut observed)
            .await
            .unwrap();
        assert!(revoked.is_empty());
        assert_eq!(observed, mask);
        assert_eq!(sequencer.next_nonce(), before);
    }

    #[tokio::test]
    async fn test_hand_over_only_from_current_owner() {
        let deployer = Address::repeat_byte(0x11);
        let admin = Address::repeat_byte(0x22);
        let ledger = SimulatedLedger::new();
        let mut sequencer = TxSequencer::sync(&ledger, deployer).await.unwrap();
        let receipt = sequencer
            .send(
                &ledger,
                LedgerCall::Create {
                    kind: ComponentKind::AccessController,
                    args: vec![],
                },
            )
            .await
            .unwrap();
        let controller = AccessController::new(&ledger, receipt.contract_address.unwrap());

        assert_eq!(controller.hand_over(&mut sequencer, deployer, admin).await.unwrap(), admin);
        assert_eq!(controller.owner().await.unwrap(), admin);

        // Already handed over, so no further transaction.
        let before = sequencer.next_nonce();
        assert_eq!(controller.hand_over(&mut sequencer, deployer, admin).await.unwrap(), admin);
        assert_eq!(sequencer.next_nonce(), before);
        assert!(
            controller
                .grant(&mut sequencer, deployer, Capability::PoolAdmin.mask())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_set_address_round_trips() {
        let deployer = Address::repeat_byte(0x11);
        let ledger = SimulatedLedger::new();
        let mut sequencer = TxSequencer::sync(&ledger, deployer).await.unwrap();
        let receipt = sequencer
            .send(
                &ledger,
                LedgerCall::Create {
                    kind: ComponentKind::AccessController,
                    args: vec![],
                },
            )
            .await
            .unwrap();
        let controller = AccessController::new(&ledger, receipt.contract_address.unwrap());

        let target = Address::repeat_byte(0x42);
        controller
            .set_address(&mut sequencer, Capability::Treasury, target)
            .await
            .unwrap();
        assert_eq!(controller.address_of(Capability::Treasury).await.unwrap(), target);
        assert_eq!(
            controller.address_of(Capability::LendingPool).await.unwrap(),
            Address::ZERO
        );
    }
}
