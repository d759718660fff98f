//! Solidity ABI bindings for the yield vault, its strategies and the
//! Multicall3 aggregator.

use alloy::primitives::{Address, address};
use alloy::sol;

/// Canonical Multicall3 deployment, identical on every EVM chain it is
/// deployed to.
pub(crate) const MULTICALL3: Address = address!("0xcA11bde05977b3631167028862bE2a173976CA11");

sol! {
    #[sol(all_derives = true)]
    interface IYieldVault {
        event Deposit(address indexed sender, address indexed owner, uint256 assets, uint256 shares);
        event Withdraw(
            address indexed sender,
            address indexed receiver,
            address indexed owner,
            uint256 assets,
            uint256 shares
        );
        event StrategyDeposit(address indexed strategy, uint256 assets);
        event StrategyWithdrawal(address indexed strategy, uint256 assets);
        event StrategyAllocationUpdated(address indexed strategy, uint256 allocation);
        event RebalanceExecuted(address[] strategies, uint256[] allocations);
        event YieldHarvested(uint256 totalYield);

        function totalAssets() external view returns (uint256);
        function totalSupply() external view returns (uint256);
        function strategies(uint256 index) external view returns (address);
        function strategyAllocations(address strategy) external view returns (uint256);
        function rebalance(address[] calldata strategies, uint256[] calldata allocations) external;
    }
}

sol! {
    #[sol(all_derives = true)]
    interface IStrategy {
        struct ProtocolPosition {
            string protocol;
            uint256 balance;
            uint256 healthFactor;
            uint256 supplyRateBp;
            uint256 borrowRateBp;
        }

        function name() external view returns (string memory);
        function getProtocolPositions() external view returns (ProtocolPosition[] memory);
    }
}

sol! {
    #[sol(all_derives = true)]
    interface IMulticall3 {
        struct Call {
            address target;
            bytes callData;
        }

        struct Result {
            bool success;
            bytes returnData;
        }

        function tryAggregate(bool requireSuccess, Call[] calldata calls)
            external
            payable
            returns (Result[] memory returnData);
    }
}
