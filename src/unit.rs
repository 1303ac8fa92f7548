/// Version byte of the only protocol variant implemented here
pub const VERSION_0: u8 = 0xA0;

/// PDU unit types
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UnitType {
    LocalSearch = 0x00,
    PropagatingSearch = 0x01,
    GetAcceptableData = 0x10,
    ProcessData = 0x11,
    GetAffinities = 0x12,
    ItemResponse = 0x20,
    SetResponse = 0x21,
    AssemblyResponse = 0x22,
    AffinityResponse = 0x23,
    IncompatibleError = 0x30,
    UnitError = 0x31,
    DataError = 0x32,
    Nothing = 0xFF,
}

impl UnitType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(UnitType::LocalSearch),
            0x01 => Some(UnitType::PropagatingSearch),
            0x10 => Some(UnitType::GetAcceptableData),
            0x11 => Some(UnitType::ProcessData),
            0x12 => Some(UnitType::GetAffinities),
            0x20 => Some(UnitType::ItemResponse),
            0x21 => Some(UnitType::SetResponse),
            0x22 => Some(UnitType::AssemblyResponse),
            0x23 => Some(UnitType::AffinityResponse),
            0x30 => Some(UnitType::IncompatibleError),
            0x31 => Some(UnitType::UnitError),
            0x32 => Some(UnitType::DataError),
            0xFF => Some(UnitType::Nothing),
            _ => None,
        }
    }

    /// Request kinds a client may open a round trip with
    pub fn is_request(self) -> bool {
        matches!(
            self,
            UnitType::LocalSearch
                | UnitType::PropagatingSearch
                | UnitType::GetAcceptableData
                | UnitType::ProcessData
                | UnitType::GetAffinities
        )
    }

    /// Failure kinds a peer answers with instead of the requested type
    pub fn is_error(self) -> bool {
        matches!(
            self,
            UnitType::IncompatibleError | UnitType::UnitError | UnitType::DataError
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_code_maps_back() {
        for byte in 0..=u8::MAX {
            if let Some(unit) = UnitType::from_u8(byte) {
                assert_eq!(unit as u8, byte);
            }
        }
        assert_eq!(UnitType::from_u8(0x13), None);
        assert_eq!(UnitType::from_u8(0xFF), Some(UnitType::Nothing));
    }

    #[test]
    fn test_kinds() {
        assert!(UnitType::ProcessData.is_request());
        assert!(!UnitType::ItemResponse.is_request());
        assert!(UnitType::DataError.is_error());
        assert!(!UnitType::Nothing.is_error());
    }
}
