//! FundMe: Single-file Solana program with embedded funding ledger.

#![no_std]
#![deny(unsafe_code)]

// 1. mod constants
pub mod constants {
    use core::mem::{size_of, align_of};
    use crate::state::FundConfig;
    use fundme::FundingLedger;

    pub const MAGIC: u64 = 0x46554e444d455631; // "FUNDMEV1"
    pub const VERSION: u32 = 1;

    pub const HEADER_LEN: usize = 64;
    pub const CONFIG_LEN: usize = size_of::<FundConfig>();
    pub const LEDGER_ALIGN: usize = align_of::<FundingLedger>();

    pub const fn align_up(x: usize, a: usize) -> usize {
        (x + (a - 1)) & !(a - 1)
    }

    pub const LEDGER_OFF: usize = align_up(HEADER_LEN + CONFIG_LEN, LEDGER_ALIGN);
    pub const LEDGER_LEN: usize = size_of::<FundingLedger>();
    pub const SLAB_LEN: usize = LEDGER_OFF + LEDGER_LEN;

    pub const MAX_UNIT_DECIMALS: u8 = 18;
}

// 2. mod zc (Zero-Copy unsafe island)
#[allow(unsafe_code)]
pub mod zc {
    use solana_program::program_error::ProgramError;
    use fundme::FundingLedger;
    use crate::constants::{LEDGER_OFF, LEDGER_LEN, LEDGER_ALIGN};

    #[inline]
    pub fn ledger_ref<'a>(data: &'a [u8]) -> Result<&'a FundingLedger, ProgramError> {
        if data.len() < LEDGER_OFF + LEDGER_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_ptr().add(LEDGER_OFF) };
        if (ptr as usize) % LEDGER_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &*(ptr as *const FundingLedger) })
    }

    #[inline]
    pub fn ledger_mut<'a>(data: &'a mut [u8]) -> Result<&'a mut FundingLedger, ProgramError> {
        if data.len() < LEDGER_OFF + LEDGER_LEN {
            return Err(ProgramError::InvalidAccountData);
        }
        let ptr = unsafe { data.as_mut_ptr().add(LEDGER_OFF) };
        if (ptr as usize) % LEDGER_ALIGN != 0 {
            return Err(ProgramError::InvalidAccountData);
        }
        Ok(unsafe { &mut *(ptr as *mut FundingLedger) })
    }
}

// 3. mod error
pub mod error {
    use solana_program::program_error::ProgramError;
    use fundme::LedgerError;

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub enum FundMeError {
        InvalidVersion,
        AlreadyInitialized,
        NotInitialized,
        InvalidSlabLen,
        WrongPriceFeed,
        OracleStale,
        OracleConfTooWide,
        OracleInvalid,
        InvalidVaultAta,
        InvalidMint,
        UnsupportedMintDecimals,
        ExpectedSigner,
        ExpectedWritable,
        TransferFailed,
        // Ledger errors mapped:
        LedgerNotOwner,
        LedgerInsufficientContribution,
        LedgerIndexOutOfRange,
        LedgerFull,
        LedgerOverflow,
    }

    impl From<FundMeError> for ProgramError {
        fn from(e: FundMeError) -> Self {
            ProgramError::Custom(e as u32)
        }
    }

    pub fn map_ledger_error(e: LedgerError) -> ProgramError {
        let err = match e {
            LedgerError::NotOwner => FundMeError::LedgerNotOwner,
            LedgerError::InsufficientContribution => FundMeError::LedgerInsufficientContribution,
            LedgerError::IndexOutOfRange => FundMeError::LedgerIndexOutOfRange,
            LedgerError::LedgerFull => FundMeError::LedgerFull,
            LedgerError::Overflow => FundMeError::LedgerOverflow,
        };
        ProgramError::Custom(err as u32)
    }
}

// 4. mod ix
pub mod ix {
    use solana_program::{pubkey::Pubkey, program_error::ProgramError};

    #[derive(Debug)]
    pub enum Instruction {
        InitFund {
            price_feed: Pubkey,
            max_staleness_slots: u64,
            conf_filter_bps: u16,
        },
        Fund { amount: u64 },
        Withdraw,
        CheaperWithdraw,
    }

    impl Instruction {
        pub fn decode(input: &[u8]) -> Result<Self, ProgramError> {
            let (&tag, mut rest) = input.split_first().ok_or(ProgramError::InvalidInstructionData)?;

            match tag {
                0 => { // InitFund
                    let price_feed = read_pubkey(&mut rest)?;
                    let max_staleness_slots = read_u64(&mut rest)?;
                    let conf_filter_bps = read_u16(&mut rest)?;
                    Ok(Instruction::InitFund { price_feed, max_staleness_slots, conf_filter_bps })
                },
                1 => { // Fund
                    let amount = read_u64(&mut rest)?;
                    Ok(Instruction::Fund { amount })
                },
                2 => Ok(Instruction::Withdraw),
                3 => Ok(Instruction::CheaperWithdraw),
                _ => Err(ProgramError::InvalidInstructionData),
            }
        }
    }

    fn read_u16(input: &mut &[u8]) -> Result<u16, ProgramError> {
        if input.len() < 2 { return Err(ProgramError::InvalidInstructionData); }
        let (bytes, rest) = input.split_at(2);
        *input = rest;
        Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(input: &mut &[u8]) -> Result<u64, ProgramError> {
        if input.len() < 8 { return Err(ProgramError::InvalidInstructionData); }
        let (bytes, rest) = input.split_at(8);
        *input = rest;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, ProgramError> {
        if input.len() < 32 { return Err(ProgramError::InvalidInstructionData); }
        let (bytes, rest) = input.split_at(32);
        *input = rest;
        Ok(Pubkey::new_from_array(bytes.try_into().unwrap()))
    }
}

// 5. mod accounts
pub mod accounts {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError, pubkey::Pubkey};
    use crate::error::FundMeError;

    pub fn expect_len(accounts: &[AccountInfo], n: usize) -> Result<(), ProgramError> {
        if accounts.len() < n {
            return Err(ProgramError::NotEnoughAccountKeys);
        }
        Ok(())
    }

    pub fn expect_signer(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_signer {
            return Err(FundMeError::ExpectedSigner.into());
        }
        Ok(())
    }

    pub fn expect_writable(ai: &AccountInfo) -> Result<(), ProgramError> {
        if !ai.is_writable {
            return Err(FundMeError::ExpectedWritable.into());
        }
        Ok(())
    }

    pub fn expect_owner(ai: &AccountInfo, owner: &Pubkey) -> Result<(), ProgramError> {
        if ai.owner != owner {
            return Err(ProgramError::IllegalOwner);
        }
        Ok(())
    }

    pub fn expect_key(ai: &AccountInfo, expected: &Pubkey) -> Result<(), ProgramError> {
        if ai.key != expected {
            return Err(ProgramError::InvalidArgument);
        }
        Ok(())
    }

    pub fn derive_vault_authority(program_id: &Pubkey, slab_key: &Pubkey) -> (Pubkey, u8) {
        Pubkey::find_program_address(&[b"vault", slab_key.as_ref()], program_id)
    }
}

// 6. mod state
pub mod state {
    use bytemuck::{Pod, Zeroable};
    use core::cell::RefMut;
    use solana_program::account_info::AccountInfo;
    use solana_program::program_error::ProgramError;
    use crate::constants::{HEADER_LEN, CONFIG_LEN};

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct SlabHeader {
        pub magic: u64,
        pub version: u32,
        pub bump: u8,
        pub _padding: [u8; 3],
        pub owner: [u8; 32],
        pub _reserved: [u8; 16],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Pod, Zeroable)]
    pub struct FundConfig {
        pub collateral_mint: [u8; 32],
        pub vault_pubkey: [u8; 32],
        pub price_feed: [u8; 32],
        pub max_staleness_slots: u64,
        pub conf_filter_bps: u16,
        pub vault_authority_bump: u8,
        pub unit_decimals: u8,
        pub _padding: [u8; 4],
    }

    pub fn slab_data_mut<'a, 'b>(ai: &'b AccountInfo<'a>) -> Result<RefMut<'b, &'a mut [u8]>, ProgramError> {
        Ok(ai.try_borrow_mut_data()?)
    }

    pub fn read_header(data: &[u8]) -> SlabHeader {
        let mut h = SlabHeader::zeroed();
        let src = &data[..HEADER_LEN];
        let dst = bytemuck::bytes_of_mut(&mut h);
        dst.copy_from_slice(src);
        h
    }

    pub fn write_header(data: &mut [u8], h: &SlabHeader) {
        let src = bytemuck::bytes_of(h);
        let dst = &mut data[..HEADER_LEN];
        dst.copy_from_slice(src);
    }

    pub fn read_config(data: &[u8]) -> FundConfig {
        let mut c = FundConfig::zeroed();
        let src = &data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        let dst = bytemuck::bytes_of_mut(&mut c);
        dst.copy_from_slice(src);
        c
    }

    pub fn write_config(data: &mut [u8], c: &FundConfig) {
        let src = bytemuck::bytes_of(c);
        let dst = &mut data[HEADER_LEN..HEADER_LEN + CONFIG_LEN];
        dst.copy_from_slice(src);
    }
}

// 7. mod oracle
pub mod oracle {
    use solana_program::{account_info::AccountInfo, program_error::ProgramError};
    use crate::error::FundMeError;

    pub fn read_price_e6(price_ai: &AccountInfo, now_slot: u64, max_staleness: u64, conf_bps: u16) -> Result<u64, ProgramError> {
        let data = price_ai.try_borrow_data()?;
        if data.len() < 208 {
            return Err(ProgramError::InvalidAccountData);
        }

        let expo = i32::from_le_bytes(data[20..24].try_into().unwrap());
        let price = i64::from_le_bytes(data[176..184].try_into().unwrap());
        let conf = u64::from_le_bytes(data[184..192].try_into().unwrap());
        let pub_slot = u64::from_le_bytes(data[200..208].try_into().unwrap());

        if price <= 0 {
            return Err(FundMeError::OracleInvalid.into());
        }

        let age = now_slot.saturating_sub(pub_slot);
        if age > max_staleness {
            return Err(FundMeError::OracleStale.into());
        }

        let price_u = price as u128;
        let lhs = (conf as u128) * 10_000;
        let rhs = price_u * (conf_bps as u128);
        if lhs > rhs {
            return Err(FundMeError::OracleConfTooWide.into());
        }

        // Exponents whose scale factor cannot be represented read as a
        // bad feed, the same as a non-positive price.
        let scale = expo.checked_add(6).ok_or(FundMeError::OracleInvalid)?;
        let final_price_u128 = if scale >= 0 {
            let mul = 10u128.checked_pow(scale as u32).ok_or(FundMeError::OracleInvalid)?;
            price_u.checked_mul(mul).ok_or(FundMeError::LedgerOverflow)?
        } else {
            let div = 10u128.checked_pow(scale.unsigned_abs()).ok_or(FundMeError::OracleInvalid)?;
            price_u / div
        };

        if final_price_u128 == 0 {
            return Err(FundMeError::OracleInvalid.into());
        }
        if final_price_u128 > u64::MAX as u128 {
            return Err(FundMeError::LedgerOverflow.into());
        }

        Ok(final_price_u128 as u64)
    }
}

// 8. mod vault
pub mod vault {
    use solana_program::{
        account_info::AccountInfo, program_error::ProgramError,
    };

    #[cfg(not(any(test, feature = "test")))]
    use solana_program::program::{invoke, invoke_signed};

    #[cfg(any(test, feature = "test"))]
    use solana_program::program_pack::Pack;
    #[cfg(any(test, feature = "test"))]
    use spl_token::state::Account as TokenAccount;

    pub fn deposit<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64
    ) -> Result<(), ProgramError> {
        #[cfg(not(any(test, feature = "test")))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke(&ix, &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()])
        }
        #[cfg(any(test, feature = "test"))]
        {
            let mut src_data = source.try_borrow_mut_data()?;
            let mut src_state = TokenAccount::unpack(&src_data)?;
            src_state.amount = src_state.amount.checked_sub(amount).ok_or(ProgramError::InsufficientFunds)?;
            TokenAccount::pack(src_state, &mut src_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state.amount.checked_add(amount).ok_or(ProgramError::InvalidAccountData)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }

    pub fn payout<'a>(
        _token_program: &AccountInfo<'a>,
        source: &AccountInfo<'a>,
        dest: &AccountInfo<'a>,
        _authority: &AccountInfo<'a>,
        amount: u64,
        _signer_seeds: &[&[&[u8]]],
    ) -> Result<(), ProgramError> {
        #[cfg(not(any(test, feature = "test")))]
        {
            let ix = spl_token::instruction::transfer(
                _token_program.key,
                source.key,
                dest.key,
                _authority.key,
                &[],
                amount,
            )?;
            invoke_signed(&ix, &[source.clone(), dest.clone(), _authority.clone(), _token_program.clone()], _signer_seeds)
        }
        #[cfg(any(test, feature = "test"))]
        {
            use crate::error::FundMeError;

            let mut src_data = source.try_borrow_mut_data()?;
            let mut src_state = TokenAccount::unpack(&src_data)?;
            src_state.amount = src_state.amount.checked_sub(amount).ok_or(FundMeError::TransferFailed)?;
            TokenAccount::pack(src_state, &mut src_data)?;

            let mut dst_data = dest.try_borrow_mut_data()?;
            let mut dst_state = TokenAccount::unpack(&dst_data)?;
            dst_state.amount = dst_state.amount.checked_add(amount).ok_or(FundMeError::TransferFailed)?;
            TokenAccount::pack(dst_state, &mut dst_data)?;
            Ok(())
        }
    }
}

// 9. mod processor
pub mod processor {
    use solana_program::{
        account_info::AccountInfo, entrypoint::ProgramResult, pubkey::Pubkey,
        sysvar::{clock::Clock, Sysvar},
        program_error::ProgramError,
        program_pack::Pack,
    };
    use crate::{
        ix::Instruction,
        state::{self, SlabHeader, FundConfig},
        accounts,
        constants::{MAGIC, VERSION, SLAB_LEN, MAX_UNIT_DECIMALS},
        error::{FundMeError, map_ledger_error},
        oracle,
        vault,
        zc,
    };

    fn slab_guard(program_id: &Pubkey, slab: &AccountInfo, data: &[u8]) -> Result<(), ProgramError> {
        accounts::expect_owner(slab, program_id)?;
        if data.len() != SLAB_LEN { return Err(FundMeError::InvalidSlabLen.into()); }
        Ok(())
    }

    fn require_initialized(data: &[u8]) -> Result<(), ProgramError> {
        let h = state::read_header(data);
        if h.magic != MAGIC { return Err(FundMeError::NotInitialized.into()); }
        if h.version != VERSION { return Err(FundMeError::InvalidVersion.into()); }
        Ok(())
    }

    fn verify_vault(a_vault: &AccountInfo, expected_owner: &Pubkey, expected_mint: &Pubkey, expected_pubkey: &Pubkey) -> Result<(), ProgramError> {
        if a_vault.key != expected_pubkey { return Err(FundMeError::InvalidVaultAta.into()); }
        if a_vault.owner != &spl_token::ID { return Err(FundMeError::InvalidVaultAta.into()); }
        if a_vault.data_len() != spl_token::state::Account::LEN { return Err(FundMeError::InvalidVaultAta.into()); }

        let data = a_vault.try_borrow_data()?;
        let tok = spl_token::state::Account::unpack(&data)?;
        if tok.mint != *expected_mint { return Err(FundMeError::InvalidMint.into()); }
        if tok.owner != *expected_owner { return Err(FundMeError::InvalidVaultAta.into()); }
        Ok(())
    }

    pub fn process_instruction<'a, 'b>(
        program_id: &Pubkey,
        accounts: &'b [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        let instruction = Instruction::decode(instruction_data)?;

        match instruction {
            Instruction::InitFund { price_feed, max_staleness_slots, conf_filter_bps } => {
                accounts::expect_len(accounts, 4)?;
                let a_owner = &accounts[0];
                let a_slab = &accounts[1];
                let a_mint = &accounts[2];
                let a_vault = &accounts[3];

                accounts::expect_signer(a_owner)?;
                accounts::expect_writable(a_slab)?;

                #[cfg(debug_assertions)]
                {
                    if core::mem::size_of::<SlabHeader>() != crate::constants::HEADER_LEN {
                        return Err(ProgramError::InvalidAccountData);
                    }
                }

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;

                let _ = zc::ledger_mut(&mut data)?;

                let header = state::read_header(&data);
                if header.magic == MAGIC { return Err(FundMeError::AlreadyInitialized.into()); }

                accounts::expect_owner(a_mint, &spl_token::ID)?;
                let unit_decimals = {
                    let mint_data = a_mint.try_borrow_data()?;
                    spl_token::state::Mint::unpack(&mint_data)?.decimals
                };
                if unit_decimals > MAX_UNIT_DECIMALS {
                    return Err(FundMeError::UnsupportedMintDecimals.into());
                }

                let (auth, bump) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(a_vault, &auth, a_mint.key, a_vault.key)?;

                for b in data.iter_mut() { *b = 0; }

                zc::ledger_mut(&mut data)?.init_in_place(a_owner.key.to_bytes(), unit_decimals);

                let config = FundConfig {
                    collateral_mint: a_mint.key.to_bytes(),
                    vault_pubkey: a_vault.key.to_bytes(),
                    price_feed: price_feed.to_bytes(),
                    max_staleness_slots,
                    conf_filter_bps,
                    vault_authority_bump: bump,
                    unit_decimals,
                    _padding: [0; 4],
                };
                state::write_config(&mut data, &config);

                let new_header = SlabHeader {
                    magic: MAGIC,
                    version: VERSION,
                    bump,
                    _padding: [0; 3],
                    owner: a_owner.key.to_bytes(),
                    _reserved: [0; 16],
                };
                state::write_header(&mut data, &new_header);
            },
            Instruction::Fund { amount } => {
                accounts::expect_len(accounts, 7)?;
                let a_funder = &accounts[0];
                let a_slab = &accounts[1];
                let a_funder_ata = &accounts[2];
                let a_vault = &accounts[3];
                let a_token = &accounts[4];
                let a_clock = &accounts[5];
                let a_feed = &accounts[6];

                accounts::expect_signer(a_funder)?;
                accounts::expect_writable(a_slab)?;

                let mut data = state::slab_data_mut(a_slab)?;
                slab_guard(program_id, a_slab, &data)?;
                require_initialized(&data)?;
                let config = state::read_config(&data);

                let (auth, _) = accounts::derive_vault_authority(program_id, a_slab.key);
                verify_vault(a_vault, &auth, &Pubkey::new_from_array(config.collateral_mint), &Pubkey::new_from_array(config.vault_pubkey))?;

                if Pubkey::new_from_array(config.price_feed) != *a_feed.key {
                    return Err(FundMeError::WrongPriceFeed.into());
                }

                let clock = Clock::from_account_info(a_clock)?;
                let price_e6 = oracle::read_price_e6(a_feed, clock.slot, config.max_staleness_slots, config.conf_filter_bps)?;

                let ledger = zc::ledger_mut(&mut data)?;
                ledger.fund(a_funder.key.to_bytes(), amount, price_e6).map_err(map_ledger_error)?;

                vault::deposit(a_token, a_funder_ata, a_vault, a_funder, amount)?;
            },
            Instruction::Withdraw => process_withdrawal(program_id, accounts, false)?,
            Instruction::CheaperWithdraw => process_withdrawal(program_id, accounts, true)?,
        }
        Ok(())
    }

    // Both withdrawal instructions share one path; only the core clearing
    // algorithm differs.
    fn process_withdrawal(program_id: &Pubkey, accounts: &[AccountInfo], cheaper: bool) -> ProgramResult {
        accounts::expect_len(accounts, 6)?;
        let a_owner = &accounts[0];
        let a_slab = &accounts[1];
        let a_vault = &accounts[2];
        let a_owner_ata = &accounts[3];
        let a_vault_pda = &accounts[4];
        let a_token = &accounts[5];

        accounts::expect_signer(a_owner)?;
        accounts::expect_writable(a_slab)?;

        let mut data = state::slab_data_mut(a_slab)?;
        slab_guard(program_id, a_slab, &data)?;
        require_initialized(&data)?;
        let config = state::read_config(&data);

        let (derived_pda, _) = accounts::derive_vault_authority(program_id, a_slab.key);
        accounts::expect_key(a_vault_pda, &derived_pda)?;
        verify_vault(a_vault, &derived_pda, &Pubkey::new_from_array(config.collateral_mint), &Pubkey::new_from_array(config.vault_pubkey))?;

        let ledger = zc::ledger_mut(&mut data)?;
        let caller = a_owner.key.to_bytes();
        if cheaper {
            ledger.cheaper_withdraw(&caller).map_err(map_ledger_error)?;
        } else {
            ledger.withdraw(&caller).map_err(map_ledger_error)?;
        }

        // Sweep the full vault balance, not just the tracked pool, so
        // tokens sent to the vault outside Fund still reach the owner.
        let vault_balance = {
            let vault_data = a_vault.try_borrow_data()?;
            spl_token::state::Account::unpack(&vault_data)?.amount
        };
        if vault_balance > 0 {
            let seed1: &[u8] = b"vault";
            let seed2: &[u8] = a_slab.key.as_ref();
            let bump_arr: [u8; 1] = [config.vault_authority_bump];
            let seed3: &[u8] = &bump_arr;
            let seeds: [&[u8]; 3] = [seed1, seed2, seed3];
            let signer_seeds: [&[&[u8]]; 1] = [&seeds];

            vault::payout(
                a_token,
                a_vault,
                a_owner_ata,
                a_vault_pda,
                vault_balance,
                &signer_seeds,
            )?;
        }
        Ok(())
    }
}

// 10. mod entrypoint
#[cfg(not(feature = "no-entrypoint"))]
pub mod entrypoint {
    use solana_program::{
        account_info::AccountInfo, entrypoint, entrypoint::ProgramResult, pubkey::Pubkey,
    };
    use crate::processor;

    entrypoint!(process_instruction);

    fn process_instruction<'a>(
        program_id: &Pubkey,
        accounts: &'a [AccountInfo<'a>],
        instruction_data: &[u8],
    ) -> ProgramResult {
        processor::process_instruction(program_id, accounts, instruction_data)
    }
}

// 11. mod ledger (glue)
pub mod ledger {
    pub use fundme::{Contribution, FundingLedger, LedgerError, MAX_FUNDING_EVENTS, MINIMUM_USD_E6};
}
