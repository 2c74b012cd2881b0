#[derive(thiserror::Error, Debug)]
#[allow(non_camel_case_types)]
pub enum Error {
    #[error("LGW_HAL_ERROR")]
    LGW_HAL_ERROR,

    #[error("LGW_COM_ERROR")]
    LGW_COM_ERROR,

    #[error("LGW_GPS_ERROR")]
    LGW_GPS_ERROR,
}
