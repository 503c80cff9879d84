//! Bridge contract ABI definition
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the subset of
//! the bridge the relayer reads and writes.

use alloy::sol;

sol! {
    /// Bridge contract interface for deposits and proposal voting
    #[sol(rpc)]
    contract Bridge {
        /// On-chain proposal record. `_status` is the ProposalStatus enum
        /// (Inactive, Active, Passed, Executed, Cancelled).
        struct Proposal {
            uint8 _status;
            uint200 _yesVotes;
            uint8 _yesVotesTotal;
            uint40 _proposedBlock;
        }

        /// Emitted by the source bridge when a user locks or burns an asset
        event Deposit(
            uint8 destinationDomainID,
            bytes32 resourceID,
            uint64 depositNonce,
            address indexed user,
            bytes data,
            bytes handlerResponse
        );

        /// Handler contract registered for a resource ID (zero if none)
        function _resourceIDToHandlerAddress(bytes32 resourceID) external view returns (address);

        /// Look up a proposal by origin, nonce and data hash
        function getProposal(uint8 originDomainID, uint64 depositNonce, bytes32 dataHash)
            external view returns (Proposal memory);

        /// Whether `relayer` voted on the proposal keyed by `(nonce << 8) | domainID`
        function _hasVotedOnProposal(uint72 destNonce, bytes32 dataHash, address relayer)
            external view returns (bool);

        /// Cast this relayer's vote; creates the proposal on first vote
        function voteProposal(uint8 domainID, uint64 depositNonce, bytes32 resourceID, bytes calldata data)
            external;

        /// Execute a passed proposal through its handler
        function executeProposal(
            uint8 domainID,
            uint64 depositNonce,
            bytes calldata data,
            bytes32 resourceID,
            bool revertOnFail
        ) external;
    }
}
